use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::{RequestDescriptor, TransportError};

/// Response body as handed to the frame reader.
pub type ResponseBody = BoxStream<'static, io::Result<Bytes>>;

/// Issues a request and returns the streamed response body.
///
/// Implementations only fail for connection problems and non-success
/// statuses. Anything reported inside the body is left to the frame reader.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn execute(&self, request: RequestDescriptor) -> Result<ResponseBody, TransportError>;
}

#[derive(serde::Deserialize)]
struct DaemonErrorMessage {
    message: String,
}

/// Message of a non-success response, falling back to the raw body.
pub(crate) fn daemon_message(body: &[u8]) -> String {
    serde_json::from_slice::<DaemonErrorMessage>(body)
        .map(|error| error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}
