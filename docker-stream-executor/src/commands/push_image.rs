use async_trait::async_trait;
use bollard::auth::DockerCredentials;

use crate::{
    DockerStreamError, ExecutionError, RequestDescriptor,
    auth::encode_auth_header,
    frames::ProgressEvent,
    handler::ResultExtractor,
    request::encode_path_segment,
};

use super::StreamedCommand;

/// `POST /images/{name}/push`
#[derive(Debug, Clone)]
pub struct PushImage {
    name: String,
    tag: Option<String>,
    credentials: Option<DockerCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// Manifest digest, when the registry reported one
    pub digest: Option<String>,
}

impl PushImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            credentials: None,
        }
    }

    pub fn with_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tag = Some(tag.into());

        self
    }

    pub fn with_credentials(&mut self, credentials: DockerCredentials) -> &mut Self {
        self.credentials = Some(credentials);

        self
    }
}

#[async_trait]
impl StreamedCommand for PushImage {
    type Extractor = PushExtractor;

    async fn request(&self) -> Result<RequestDescriptor, DockerStreamError> {
        // the daemon rejects pushes without the header, even for anonymous registries
        let credentials = self.credentials.clone().unwrap_or_default();

        Ok(RequestDescriptor::post(format!(
            "/images/{}/push",
            encode_path_segment(&self.name)
        ))
        .query_opt("tag", self.tag.clone())
        .header("X-Registry-Auth", encode_auth_header(&credentials)?))
    }

    fn extractor(&self) -> PushExtractor {
        PushExtractor::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushExtractor {
    digest: Option<String>,
}

impl ResultExtractor for PushExtractor {
    type Output = PushResult;

    fn observe(&mut self, event: &ProgressEvent) {
        let digest = event.digest().or_else(|| {
            // "latest: digest: sha256:... size: 528"
            let status = event.status.as_deref()?;
            let (_, rest) = status.split_once("digest: ")?;
            rest.split_whitespace().next().map(str::to_string)
        });

        if digest.is_some() {
            self.digest = digest;
        }
    }

    fn finish(self) -> Result<PushResult, ExecutionError> {
        Ok(PushResult {
            digest: self.digest,
        })
    }
}
