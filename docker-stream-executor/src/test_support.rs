//! In-memory transport used by the unit and scenario tests.
use std::{
    io,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt as _, stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    RequestDescriptor, TransportError,
    transport::{ResponseBody, Transport},
};

/// Serves one scripted response body and records every request it receives.
pub(crate) struct ScriptedTransport {
    requests: Mutex<Vec<RequestDescriptor>>,
    response: Mutex<Option<Result<ResponseBody, TransportError>>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    fn new(response: Result<ResponseBody, TransportError>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response: Mutex::new(Some(response)),
        })
    }

    /// Body made of the given chunks, closed after the last one.
    pub(crate) fn with_chunks<I, C>(chunks: I) -> Arc<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        let chunks: Vec<io::Result<Bytes>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self::new(Ok(stream::iter(chunks).boxed()))
    }

    /// Body fed by the returned sender. Dropping the sender ends the body.
    pub(crate) fn channel() -> (Arc<Self>, mpsc::Sender<io::Result<Bytes>>) {
        let (tx, rx) = mpsc::channel(16);
        (Self::new(Ok(ReceiverStream::new(rx).boxed())), tx)
    }

    pub(crate) fn failing(error: TransportError) -> Arc<Self> {
        Self::new(Err(error))
    }

    pub(crate) fn requests(&self) -> Vec<RequestDescriptor> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: RequestDescriptor) -> Result<ResponseBody, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request);

        self.response
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| {
                Err(TransportError::InvalidRequest(
                    "scripted response already served".into(),
                ))
            })
    }
}

/// JSON status line as the daemon sends it
pub(crate) fn status_line(value: serde_json::Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    line.into()
}
