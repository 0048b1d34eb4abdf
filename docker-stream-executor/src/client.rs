use std::{
    io,
    path::Path,
    sync::{Arc, OnceLock, Weak},
};

use async_trait::async_trait;
use futures_util::StreamExt as _;
use reqwest::{Certificate, ClientBuilder, Identity, header::CONTENT_TYPE};
use tokio::sync::Mutex;

use crate::{
    ConfigError, DaemonConfig, DaemonEndpoint, RequestBody, RequestDescriptor, TransportError,
    transport::{ResponseBody, Transport, daemon_message},
};

#[cfg(unix)]
use crate::unix_transport::UnixTransport;

// `Weak` so the shared transport (and its connection pool) is released once
// the last executor using it is dropped, and rebuilt on the next request.
static DAEMON_TRANSPORT: OnceLock<Mutex<Weak<DaemonTransport>>> = OnceLock::new();

/// Transport picked from the configured daemon endpoint.
#[derive(Debug)]
pub enum DaemonTransport {
    Http(HttpTransport),
    #[cfg(unix)]
    Unix(UnixTransport),
}

impl DaemonTransport {
    pub fn new(config: DaemonConfig) -> Result<Self, ConfigError> {
        match config.endpoint()? {
            DaemonEndpoint::Http(_) => Ok(Self::Http(HttpTransport::new(config)?)),
            #[cfg(unix)]
            DaemonEndpoint::Unix(_) => Ok(Self::Unix(UnixTransport::new(config)?)),
            #[cfg(not(unix))]
            DaemonEndpoint::Unix(_) => Err(ConfigError::UnsupportedScheme("unix".to_string())),
        }
    }

    /// Returns the process-wide transport configured from the environment,
    /// reusing the one still alive or creating a new one.
    pub async fn shared() -> Result<Arc<DaemonTransport>, ConfigError> {
        let mut guard = DAEMON_TRANSPORT
            .get_or_init(|| Mutex::new(Weak::new()))
            .lock()
            .await;

        if let Some(transport) = guard.upgrade() {
            Ok(transport)
        } else {
            let transport = Arc::new(DaemonTransport::new(DaemonConfig::from_env())?);
            *guard = Arc::downgrade(&transport);

            Ok(transport)
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        match self {
            Self::Http(transport) => transport.config(),
            #[cfg(unix)]
            Self::Unix(transport) => transport.config(),
        }
    }
}

#[async_trait]
impl Transport for DaemonTransport {
    async fn execute(&self, request: RequestDescriptor) -> Result<ResponseBody, TransportError> {
        match self {
            Self::Http(transport) => transport.execute(request).await,
            #[cfg(unix)]
            Self::Unix(transport) => transport.execute(request).await,
        }
    }
}

/// Streams requests to the daemon over HTTP.
#[derive(Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    config: DaemonConfig,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: DaemonConfig) -> Result<Self, ConfigError> {
        let base_url = config.base_url()?;
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout());

        if config.tls()
            && let Some(cert_path) = config.cert_path()
        {
            builder = with_tls_material(builder, &cert_path)?;
        }

        let http = builder.build().map_err(ConfigError::Client)?;

        Ok(Self {
            http,
            config,
            base_url,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, self.config.api_version(), path)
    }
}

/// Adds the daemon CA and client identity found in `cert_path`.
fn with_tls_material(mut builder: ClientBuilder, cert_path: &Path) -> Result<ClientBuilder, ConfigError> {
    let ca = cert_path.join("ca.pem");
    if ca.exists() {
        let certificate = Certificate::from_pem(&read_pem(&ca)?).map_err(ConfigError::Client)?;
        builder = builder.add_root_certificate(certificate);
    }

    let cert = cert_path.join("cert.pem");
    if cert.exists() {
        let mut pem = read_pem(&cert)?;
        pem.push(b'\n');
        pem.extend(read_pem(&cert_path.join("key.pem"))?);
        builder = builder.identity(Identity::from_pem(&pem).map_err(ConfigError::Client)?);
    }

    tracing::debug!(cert_path = ?cert_path, "Loaded tls material");
    Ok(builder)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs_err::read(path).map_err(|source| ConfigError::Tls {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn execute(&self, request: RequestDescriptor) -> Result<ResponseBody, TransportError> {
        let mut builder = self
            .http
            .request(request.method.into(), self.url(&request.path))
            .query(&request.query);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let RequestBody::Bytes { content_type, data } = request.body {
            builder = builder.header(CONTENT_TYPE, content_type).body(data);
        }

        let response = builder.send().await?;
        let status = response.status();
        tracing::debug!(%status, "Daemon responded");

        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();

            return Err(TransportError::Status {
                status: status.as_u16(),
                message: daemon_message(&body),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed())
    }
}
