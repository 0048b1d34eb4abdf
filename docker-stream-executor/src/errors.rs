use std::{path::PathBuf, path::StripPrefixError, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerStreamError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Error, Debug)]
pub enum IgnoreError {
    #[error("invalid ignore pattern `{pattern}` on line {line}: {reason}")]
    InvalidPattern {
        line: usize,
        pattern: String,
        reason: String,
    },

    #[error("failed to read ignore file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error("failed while walking files in context: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to convert to relative path {0}")]
    RelativePath(#[from] StripPrefixError),

    #[error("build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("dockerfile not found: {0}")]
    MissingDockerfile(PathBuf),

    #[error("dockerfile `{0}` is excluded by .dockerignore")]
    DockerfileExcluded(String),

    #[error("path escapes the build context: {0}")]
    PathEscapesRoot(PathBuf),

    #[error("error compressing context: {0}")]
    Compression(std::io::Error),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("stream ended inside a frame ({pending} bytes pending)")]
    Truncated { pending: usize },

    #[error("error reading response stream: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("remote operation failed: {message}")]
    RemoteOperation { message: String, code: Option<i64> },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("stream truncated mid-frame ({pending} bytes pending)")]
    TruncatedStream { pending: usize },

    #[error("error reading response stream: {0}")]
    Stream(std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timed out after {0:?} waiting for the command to finish")]
    Timeout(Duration),

    #[error("command was cancelled")]
    Cancelled,

    #[error("stream completed without a result: {0}")]
    NoResultFound(String),

    #[error("outcome of this execution was already consumed")]
    OutcomeConsumed,

    #[error("execution task ended without reporting an outcome")]
    Abandoned,
}

impl From<FrameError> for ExecutionError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Truncated { pending } => ExecutionError::TruncatedStream { pending },
            FrameError::Io(err) => ExecutionError::Stream(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("daemon responded with {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to send request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http exchange with the daemon failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported docker host scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid docker host: {0}")]
    InvalidHost(String),

    #[error("failed to initialize http client: {0}")]
    Client(reqwest::Error),

    #[error("failed to read tls material {path}: {source}")]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("failed to read docker config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse docker config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid credentials for {registry}: {message}")]
    Decode { registry: String, message: String },

    #[error("failed to encode credentials: {0}")]
    Encode(serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("failed to encode query parameter: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}
