use std::fmt;

use async_trait::async_trait;

use crate::{
    DockerStreamError, ExecutionError, RequestDescriptor, frames::ProgressEvent,
    handler::ResultExtractor, request::encode_path_segment,
};

use super::StreamedCommand;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitCondition {
    #[default]
    NotRunning,
    NextExit,
    Removed,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::NotRunning => f.write_str("not-running"),
            WaitCondition::NextExit => f.write_str("next-exit"),
            WaitCondition::Removed => f.write_str("removed"),
        }
    }
}

/// `POST /containers/{id}/wait`, resolving to the exit code.
#[derive(Debug, Clone)]
pub struct WaitContainer {
    container: String,
    condition: WaitCondition,
}

impl WaitContainer {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            condition: WaitCondition::default(),
        }
    }

    pub fn with_condition(&mut self, condition: WaitCondition) -> &mut Self {
        self.condition = condition;

        self
    }
}

#[async_trait]
impl StreamedCommand for WaitContainer {
    type Extractor = StatusCodeExtractor;

    async fn request(&self) -> Result<RequestDescriptor, DockerStreamError> {
        Ok(RequestDescriptor::post(format!(
            "/containers/{}/wait",
            encode_path_segment(&self.container)
        ))
        .query("condition", self.condition.to_string()))
    }

    fn extractor(&self) -> StatusCodeExtractor {
        StatusCodeExtractor::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusCodeExtractor {
    status_code: Option<i64>,
    error: Option<String>,
}

impl ResultExtractor for StatusCodeExtractor {
    type Output = i64;

    fn observe(&mut self, event: &ProgressEvent) {
        if let Some(code) = event.status_code {
            self.status_code = Some(code);
        }
        if let Some(message) = event
            .wait_error
            .as_ref()
            .and_then(|error| error.message.as_ref())
            .filter(|message| !message.is_empty())
        {
            self.error = Some(message.clone());
        }
    }

    fn finish(self) -> Result<i64, ExecutionError> {
        if let Some(message) = self.error {
            return Err(ExecutionError::RemoteOperation {
                message,
                code: self.status_code,
            });
        }

        self.status_code.ok_or_else(|| {
            ExecutionError::NoResultFound("wait response did not contain a status code".into())
        })
    }

    // the wait endpoint sends a single object, anything else is a protocol mismatch
    fn malformed_frames_are_fatal(&self) -> bool {
        true
    }
}
