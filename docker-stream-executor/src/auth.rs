//! Registry credentials from the docker client config and the headers that carry them.
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use base64::Engine as _;
use bollard::auth::DockerCredentials;
use serde::Deserialize;

use crate::AuthError;

pub const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_LEGACY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
    identitytoken: Option<String>,
}

/// Looks up credentials in `$DOCKER_CONFIG/config.json` or `~/.docker/config.json`.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|home| home.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    pub fn with_config_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Credentials for the registry `image` lives in, if configured.
    pub fn credentials_for(&self, image: &str) -> Result<Option<DockerCredentials>, AuthError> {
        let registry = extract_registry(image);
        let config = self.load()?;

        let mut candidates = vec![registry.clone()];
        if registry == DOCKER_HUB {
            candidates.push(DOCKER_HUB_LEGACY.to_string());
        }

        for candidate in candidates {
            if let Some(entry) = config.auths.get(&candidate)
                && let Some(credentials) = decode_entry(entry, &candidate)?
            {
                tracing::debug!(registry = candidate, "Found registry credentials");
                return Ok(Some(credentials));
            }
        }

        tracing::debug!(registry, "No registry credentials found");
        Ok(None)
    }

    /// Every usable entry, keyed by registry. Used for builds that pull from
    /// several registries.
    pub fn all_credentials(&self) -> Result<BTreeMap<String, DockerCredentials>, AuthError> {
        let config = self.load()?;

        let mut credentials = BTreeMap::new();
        for (registry, entry) in &config.auths {
            if let Some(decoded) = decode_entry(entry, registry)? {
                credentials.insert(registry.clone(), decoded);
            }
        }
        Ok(credentials)
    }

    fn load(&self) -> Result<DockerConfigFile, AuthError> {
        if !self.config_path.exists() {
            tracing::debug!(path = ?self.config_path, "Docker config not found");
            return Ok(DockerConfigFile::default());
        }

        let content = fs_err::read_to_string(&self.config_path).map_err(|source| AuthError::Read {
            path: self.config_path.clone(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| AuthError::Parse {
            path: self.config_path.clone(),
            source,
        })
    }
}

fn decode_entry(entry: &AuthEntry, registry: &str) -> Result<Option<DockerCredentials>, AuthError> {
    if let Some(token) = &entry.identitytoken {
        return Ok(Some(DockerCredentials {
            identitytoken: Some(token.clone()),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }));
    }

    let Some(auth) = entry.auth.as_deref().filter(|auth| !auth.is_empty()) else {
        return Ok(None);
    };

    let decode_error = |message: String| AuthError::Decode {
        registry: registry.to_string(),
        message,
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .map_err(|err| decode_error(err.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|err| decode_error(err.to_string()))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| decode_error("expected `username:password`".to_string()))?;

    Ok(Some(DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

/// Registry part of an image reference, `docker.io` when none is given.
///
/// The first path component counts as a registry when it contains a `.` or a
/// `:`, or is `localhost`.
pub fn extract_registry(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => DOCKER_HUB.to_string(),
    }
}

/// Value of the `X-Registry-Auth` header
pub fn encode_auth_header(credentials: &DockerCredentials) -> Result<String, AuthError> {
    let json = serde_json::to_vec(credentials).map_err(AuthError::Encode)?;
    Ok(base64::engine::general_purpose::URL_SAFE.encode(json))
}

/// Value of the `X-Registry-Config` header, a map of registry to credentials
pub fn encode_config_header(
    credentials: &BTreeMap<String, DockerCredentials>,
) -> Result<String, AuthError> {
    let json = serde_json::to_vec(credentials).map_err(AuthError::Encode)?;
    Ok(base64::engine::general_purpose::URL_SAFE.encode(json))
}
