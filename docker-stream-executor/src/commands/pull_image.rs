use async_trait::async_trait;
use bollard::auth::DockerCredentials;

use crate::{
    DockerStreamError, ExecutionError, RequestDescriptor, auth::encode_auth_header,
    frames::ProgressEvent, handler::ResultExtractor,
};

use super::StreamedCommand;

/// `POST /images/create?fromImage=...`
#[derive(Debug, Clone)]
pub struct PullImage {
    image: String,
    tag: Option<String>,
    platform: Option<String>,
    credentials: Option<DockerCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    /// Final status line, e.g. `Status: Downloaded newer image for alpine:3.20`
    pub status: String,
    pub digest: Option<String>,
}

impl PullImage {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: None,
            platform: None,
            credentials: None,
        }
    }

    pub fn with_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tag = Some(tag.into());

        self
    }

    pub fn with_platform(&mut self, platform: impl Into<String>) -> &mut Self {
        self.platform = Some(platform.into());

        self
    }

    pub fn with_credentials(&mut self, credentials: DockerCredentials) -> &mut Self {
        self.credentials = Some(credentials);

        self
    }
}

#[async_trait]
impl StreamedCommand for PullImage {
    type Extractor = PullExtractor;

    async fn request(&self) -> Result<RequestDescriptor, DockerStreamError> {
        let mut request = RequestDescriptor::post("/images/create")
            .query("fromImage", &self.image)
            .query_opt("tag", self.tag.clone())
            .query_opt("platform", self.platform.clone());

        if let Some(credentials) = &self.credentials {
            request = request.header("X-Registry-Auth", encode_auth_header(credentials)?);
        }

        Ok(request)
    }

    fn extractor(&self) -> PullExtractor {
        PullExtractor::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullExtractor {
    status: Option<String>,
    digest: Option<String>,
}

impl ResultExtractor for PullExtractor {
    type Output = PulledImage;

    fn observe(&mut self, event: &ProgressEvent) {
        let Some(status) = event.status.as_deref() else {
            return;
        };

        if let Some(digest) = status.strip_prefix("Digest: ") {
            self.digest = Some(digest.trim().to_string());
        } else if status.starts_with("Status: ") {
            self.status = Some(status.trim().to_string());
        }
    }

    fn finish(self) -> Result<PulledImage, ExecutionError> {
        let status = self.status.ok_or_else(|| {
            ExecutionError::NoResultFound("pull finished without a final status".into())
        })?;

        Ok(PulledImage {
            status,
            digest: self.digest,
        })
    }
}
