use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use http_body_util::{BodyExt as _, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::{
    ConfigError, DaemonConfig, DaemonEndpoint, RequestBody, RequestDescriptor, TransportError,
    transport::{ResponseBody, Transport, daemon_message},
};

/// Streams requests to a daemon listening on a unix socket.
///
/// Every request gets its own connection, which lives as long as its response
/// body.
#[derive(Debug)]
pub struct UnixTransport {
    socket_path: PathBuf,
    config: DaemonConfig,
}

impl UnixTransport {
    pub fn new(config: DaemonConfig) -> Result<Self, ConfigError> {
        match config.endpoint()? {
            DaemonEndpoint::Unix(socket_path) => Ok(Self {
                socket_path,
                config,
            }),
            DaemonEndpoint::Http(_) => Err(ConfigError::UnsupportedScheme(
                config.host().split("://").next().unwrap_or_default().to_string(),
            )),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<UnixStream, TransportError> {
        let connect_error = |source| TransportError::Connect {
            path: self.socket_path.clone(),
            source,
        };

        tokio::time::timeout(
            self.config.connect_timeout(),
            UnixStream::connect(&self.socket_path),
        )
        .await
        .map_err(|_| connect_error(io::ErrorKind::TimedOut.into()))?
        .map_err(connect_error)
    }
}

/// Origin-form target: versioned path plus the url encoded query.
fn request_target(api_version: &str, request: &RequestDescriptor) -> Result<String, TransportError> {
    let mut url = reqwest::Url::parse(&format!("http://docker/{api_version}{}", request.path))
        .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
    if !request.query.is_empty() {
        url.query_pairs_mut().extend_pairs(&request.query);
    }

    Ok(match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    })
}

#[async_trait]
impl Transport for UnixTransport {
    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path, socket = ?self.socket_path))]
    async fn execute(&self, request: RequestDescriptor) -> Result<ResponseBody, TransportError> {
        let target = request_target(self.config.api_version(), &request)?;
        let stream = self.connect().await?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "Daemon connection closed with an error");
            }
        });

        let method: reqwest::Method = request.method.into();
        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(target)
            .header(HOST, "docker");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = match request.body {
            RequestBody::Empty => Full::new(Bytes::new()),
            RequestBody::Bytes { content_type, data } => {
                builder = builder.header(CONTENT_TYPE, content_type);
                Full::new(data)
            }
        };
        let request = builder
            .body(body)
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        tracing::debug!(%status, "Daemon responded");

        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();

            return Err(TransportError::Status {
                status: status.as_u16(),
                message: daemon_message(&body),
            });
        }

        Ok(response
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed())
    }
}
