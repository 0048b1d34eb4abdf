use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bytes::Bytes;

use crate::{
    ContextBuilder, DEFAULT_DOCKERFILE, DockerStreamError, ExecutionError, RequestBody,
    RequestDescriptor, RequestError,
    auth::encode_config_header,
    frames::ProgressEvent,
    handler::ResultExtractor,
};

use super::StreamedCommand;

#[derive(Debug, Clone)]
pub enum BuildSource {
    /// A context directory, archived when the request is assembled
    Directory(PathBuf),
    /// A ready made tar archive
    Tarball(Bytes),
}

/// `POST /build`, resolving to the id of the built image.
#[derive(Debug, Clone)]
pub struct BuildImage {
    source: BuildSource,
    dockerfile: Option<PathBuf>,
    tags: Vec<String>,
    build_args: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    no_cache: bool,
    pull: bool,
    remove: bool,
    force_remove: bool,
    quiet: bool,
    target: Option<String>,
    network_mode: Option<String>,
    platform: Option<String>,
    cache_from: Vec<String>,
    compress: bool,
    force_include_dockerfile: bool,
    registry_auths: BTreeMap<String, DockerCredentials>,
}

impl BuildImage {
    pub fn new(source: BuildSource) -> Self {
        Self {
            source,
            dockerfile: None,
            tags: Vec::new(),
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
            no_cache: false,
            pull: false,
            remove: true,
            force_remove: false,
            quiet: false,
            target: None,
            network_mode: None,
            platform: None,
            cache_from: Vec::new(),
            compress: false,
            force_include_dockerfile: false,
            registry_auths: BTreeMap::new(),
        }
    }

    pub fn from_directory(path: impl Into<PathBuf>) -> Self {
        Self::new(BuildSource::Directory(path.into()))
    }

    pub fn from_tarball(archive: impl Into<Bytes>) -> Self {
        Self::new(BuildSource::Tarball(archive.into()))
    }

    /// Dockerfile to build. For a directory source relative paths resolve
    /// against the context; for a tarball it is the path inside the archive.
    pub fn with_dockerfile(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.dockerfile = Some(path.into());

        self
    }

    pub fn with_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.push(tag.into());

        self
    }

    pub fn with_build_arg(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.build_args.insert(key.into(), value.into());

        self
    }

    pub fn with_label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());

        self
    }

    pub fn no_cache(&mut self, no_cache: bool) -> &mut Self {
        self.no_cache = no_cache;

        self
    }

    /// Always attempt to pull a newer version of base images
    pub fn pull(&mut self, pull: bool) -> &mut Self {
        self.pull = pull;

        self
    }

    /// Remove intermediate containers after a successful build (default)
    pub fn remove(&mut self, remove: bool) -> &mut Self {
        self.remove = remove;

        self
    }

    /// Remove intermediate containers even when the build fails
    pub fn force_remove(&mut self, force_remove: bool) -> &mut Self {
        self.force_remove = force_remove;

        self
    }

    pub fn quiet(&mut self, quiet: bool) -> &mut Self {
        self.quiet = quiet;

        self
    }

    pub fn with_target(&mut self, target: impl Into<String>) -> &mut Self {
        self.target = Some(target.into());

        self
    }

    pub fn with_network_mode(&mut self, network_mode: impl Into<String>) -> &mut Self {
        self.network_mode = Some(network_mode.into());

        self
    }

    pub fn with_platform(&mut self, platform: impl Into<String>) -> &mut Self {
        self.platform = Some(platform.into());

        self
    }

    pub fn with_cache_from(&mut self, image: impl Into<String>) -> &mut Self {
        self.cache_from.push(image.into());

        self
    }

    /// Gzip the context before upload
    pub fn compress(&mut self, compress: bool) -> &mut Self {
        self.compress = compress;

        self
    }

    pub fn force_include_dockerfile(&mut self, force: bool) -> &mut Self {
        self.force_include_dockerfile = force;

        self
    }

    /// Credentials the daemon may use to pull base images from `registry`
    pub fn with_registry_auth(
        &mut self,
        registry: impl Into<String>,
        credentials: DockerCredentials,
    ) -> &mut Self {
        self.registry_auths.insert(registry.into(), credentials);

        self
    }

    pub fn with_registry_auths(
        &mut self,
        auths: impl IntoIterator<Item = (String, DockerCredentials)>,
    ) -> &mut Self {
        self.registry_auths.extend(auths);

        self
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn archive(&self) -> Result<(Bytes, String), DockerStreamError> {
        match &self.source {
            BuildSource::Directory(path) => {
                let mut builder = ContextBuilder::from_path(path)?;
                if let Some(dockerfile) = &self.dockerfile {
                    builder.with_dockerfile(dockerfile);
                }
                builder.force_include_dockerfile(self.force_include_dockerfile);

                let context = builder.build()?;
                let archive = if self.compress {
                    context.to_tar_gz().await?
                } else {
                    context.to_tar().await?
                };

                Ok((archive.into(), context.dockerfile_name().to_string()))
            }
            BuildSource::Tarball(archive) => {
                let dockerfile = self
                    .dockerfile
                    .as_ref()
                    .map(|path| path.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string());

                Ok((archive.clone(), dockerfile))
            }
        }
    }
}

fn json_param<T: serde::Serialize>(value: &T) -> Result<String, RequestError> {
    Ok(serde_json::to_string(value)?)
}

#[async_trait]
impl StreamedCommand for BuildImage {
    type Extractor = ImageIdExtractor;

    #[tracing::instrument(skip_all, fields(tags = ?self.tags))]
    async fn request(&self) -> Result<RequestDescriptor, DockerStreamError> {
        let (archive, dockerfile) = self.archive().await?;
        tracing::debug!(dockerfile, bytes = archive.len(), "Prepared build context");

        let mut request = RequestDescriptor::post("/build").query("dockerfile", dockerfile);
        for tag in &self.tags {
            request = request.query("t", tag);
        }

        request = request
            .query_flag("q", self.quiet)
            .query_flag("nocache", self.no_cache)
            .query_flag("pull", self.pull)
            .query_bool("rm", self.remove)
            .query_flag("forcerm", self.force_remove)
            .query_opt("target", self.target.clone())
            .query_opt("networkmode", self.network_mode.clone())
            .query_opt("platform", self.platform.clone());

        if !self.build_args.is_empty() {
            request = request.query("buildargs", json_param(&self.build_args)?);
        }
        if !self.labels.is_empty() {
            request = request.query("labels", json_param(&self.labels)?);
        }
        if !self.cache_from.is_empty() {
            request = request.query("cachefrom", json_param(&self.cache_from)?);
        }
        if !self.registry_auths.is_empty() {
            request = request.header(
                "X-Registry-Config",
                encode_config_header(&self.registry_auths)?,
            );
        }

        Ok(request.body(RequestBody::tar(archive)))
    }

    fn extractor(&self) -> ImageIdExtractor {
        ImageIdExtractor::default()
    }
}

/// Keeps the last image id announced by the build.
#[derive(Debug, Clone, Default)]
pub struct ImageIdExtractor {
    image_id: Option<String>,
}

impl ResultExtractor for ImageIdExtractor {
    type Output = String;

    fn observe(&mut self, event: &ProgressEvent) {
        if let Some(id) = event.image_id() {
            tracing::debug!(image_id = id, "Build produced image");
            self.image_id = Some(id);
        }
    }

    fn finish(self) -> Result<String, ExecutionError> {
        self.image_id.ok_or_else(|| {
            ExecutionError::NoResultFound("build output did not contain an image id".into())
        })
    }
}
