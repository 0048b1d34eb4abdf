use std::{path::PathBuf, time::Duration};

use dirs::{home_dir, runtime_dir};

use crate::ConfigError;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_API_VERSION: &str = "v1.43";

/// How the daemon is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEndpoint {
    /// Base url of an http(s) endpoint, without the api version
    Http(String),
    Unix(PathBuf),
}

/// Where and how to reach the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    host: String,
    api_version: String,
    tls: bool,
    cert_path: Option<PathBuf>,
    connect_timeout: Duration,
    default_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: format!("unix://{}", get_socket_path()),
            api_version: DEFAULT_API_VERSION.to_string(),
            tls: false,
            cert_path: None,
            connect_timeout: Duration::from_secs(30),
            default_timeout: None,
        }
    }
}

impl DaemonConfig {
    /// Reads `DOCKER_HOST`, `DOCKER_API_VERSION`, `DOCKER_TLS_VERIFY` and
    /// `DOCKER_CERT_PATH`. Without `DOCKER_HOST` the local socket is used.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("DOCKER_HOST").filter(|host| !host.is_empty()) {
            config.host = host;
        }
        if let Some(version) = lookup("DOCKER_API_VERSION").filter(|v| !v.is_empty()) {
            config.api_version = if version.starts_with('v') {
                version
            } else {
                format!("v{version}")
            };
        }
        config.tls = lookup("DOCKER_TLS_VERIFY").is_some_and(|value| !value.is_empty() && value != "0");
        config.cert_path = lookup("DOCKER_CERT_PATH")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        tracing::debug!(host = config.host, api_version = config.api_version, tls = config.tls, "Loaded daemon config");
        config
    }

    pub fn with_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.host = host.into();

        self
    }

    pub fn with_api_version(&mut self, api_version: impl Into<String>) -> &mut Self {
        self.api_version = api_version.into();

        self
    }

    pub fn with_tls(&mut self, tls: bool) -> &mut Self {
        self.tls = tls;

        self
    }

    /// Directory holding `ca.pem`, `cert.pem` and `key.pem`
    pub fn with_cert_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.cert_path = Some(path.into());

        self
    }

    pub fn with_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;

        self
    }

    /// Timeout applied by [`crate::StreamExecutor::run`] when awaiting outcomes
    pub fn with_default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.default_timeout = Some(timeout);

        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// TLS material directory, `~/.docker` unless configured.
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.cert_path
            .clone()
            .or_else(|| home_dir().map(|home| home.join(".docker")))
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn endpoint(&self) -> Result<DaemonEndpoint, ConfigError> {
        let (scheme, rest) = self
            .host
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidHost(self.host.clone()))?;

        if scheme == "unix" {
            if rest.is_empty() {
                return Err(ConfigError::InvalidHost(self.host.clone()));
            }
            return Ok(DaemonEndpoint::Unix(PathBuf::from(rest)));
        }

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }

        match scheme {
            "tcp" if self.tls => Ok(DaemonEndpoint::Http(format!("https://{rest}"))),
            "tcp" => Ok(DaemonEndpoint::Http(format!("http://{rest}"))),
            "http" | "https" => Ok(DaemonEndpoint::Http(format!("{scheme}://{rest}"))),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    /// HTTP base url of the daemon, without the api version.
    pub fn base_url(&self) -> Result<String, ConfigError> {
        match self.endpoint()? {
            DaemonEndpoint::Http(url) => Ok(url),
            DaemonEndpoint::Unix(_) => Err(ConfigError::UnsupportedScheme("unix".to_string())),
        }
    }
}

/// First docker socket that exists, checking the usual install locations.
fn get_socket_path() -> String {
    validate_path(DEFAULT_DOCKER_SOCKET.into())
        .or_else(|| runtime_dir().and_then(|dir| validate_path(dir.join(".docker/run/docker.sock"))))
        .or_else(|| home_dir().and_then(|dir| validate_path(dir.join(".docker/run/docker.sock"))))
        .or_else(|| {
            home_dir().and_then(|dir| validate_path(dir.join(".docker/desktop/docker.sock")))
        })
        .unwrap_or_else(|| DEFAULT_DOCKER_SOCKET.into())
}

fn validate_path(path: PathBuf) -> Option<String> {
    path.exists().then(|| path.display().to_string())
}
