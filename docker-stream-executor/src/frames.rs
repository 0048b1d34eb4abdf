//! Frames decoded from a streamed daemon response.
use bollard::models::{ContainerWaitExitError, ErrorDetail, ProgressDetail};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One discrete unit of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Progress(ProgressEvent),
    Error(ErrorEvent),
    Raw(RawChunk),
    EndOfStream,
}

impl StreamFrame {
    pub fn is_error(&self) -> bool {
        matches!(self, StreamFrame::Error(_))
    }
}

/// A status object as sent by the build, push, pull and wait endpoints.
///
/// Every field is optional, the daemon only sends what is relevant for the
/// current step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,

    #[serde(rename = "progressDetail", skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Value>,

    #[serde(rename = "StatusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub wait_error: Option<ContainerWaitExitError>,
}

impl ProgressEvent {
    /// The image id carried by this event, if any.
    ///
    /// Recognizes the `aux.ID` object of the classic builder and the
    /// `Successfully built <id>` / `writing image <id>` status lines.
    pub fn image_id(&self) -> Option<String> {
        if let Some(id) = self.aux_str("ID") {
            return Some(id.to_string());
        }

        self.text()
            .and_then(|line| {
                line.trim()
                    .strip_prefix("Successfully built ")
                    .or_else(|| line.trim().strip_prefix("writing image "))
            })
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string)
    }

    /// Manifest digest reported at the end of a push.
    pub fn digest(&self) -> Option<String> {
        self.aux_str("Digest").map(str::to_string)
    }

    /// The human readable part of the event, `stream` before `status`.
    pub fn text(&self) -> Option<&str> {
        self.stream.as_deref().or(self.status.as_deref())
    }

    fn aux_str(&self, key: &str) -> Option<&str> {
        self.aux.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The daemon reported a failure inside the stream
    Remote,
    /// A frame could not be decoded
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub message: String,
    pub detail: Option<ErrorDetail>,
    pub kind: ErrorKind,
}

impl ErrorEvent {
    pub fn remote(message: impl Into<String>, detail: Option<ErrorDetail>) -> Self {
        Self {
            message: message.into(),
            detail,
            kind: ErrorKind::Remote,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            kind: ErrorKind::Malformed,
        }
    }

    pub fn code(&self) -> Option<i64> {
        self.detail.as_ref().and_then(|detail| detail.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdin,
    Stdout,
    Stderr,
    Unknown,
}

impl From<u8> for OutputChannel {
    fn from(value: u8) -> Self {
        match value {
            0 => OutputChannel::Stdin,
            1 => OutputChannel::Stdout,
            2 => OutputChannel::Stderr,
            _ => OutputChannel::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub channel: OutputChannel,
    pub data: Bytes,
}

impl RawChunk {
    pub fn new(channel: OutputChannel, data: impl Into<Bytes>) -> Self {
        Self {
            channel,
            data: data.into(),
        }
    }
}

/// Intermediate shape used to spot error payloads before decoding a progress event.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayload {
    pub error: Option<String>,
    #[serde(rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
}

impl ErrorPayload {
    pub(crate) fn into_event(self) -> Option<ErrorEvent> {
        match (self.error, self.error_detail) {
            (None, None) => None,
            (Some(message), detail) => Some(ErrorEvent::remote(message, detail)),
            (None, Some(detail)) => Some(ErrorEvent::remote(
                detail.message.clone().unwrap_or_default(),
                Some(detail),
            )),
        }
    }
}
