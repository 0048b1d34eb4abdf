use std::{
    io::Write as _,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

use bytes::Bytes;
use tokio::io::AsyncReadExt as _;
use tokio_tar::{Builder, EntryType, Header};
use walkdir::{DirEntry, WalkDir};

use crate::{ContextError, IgnoreMatcher};

pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
pub const DOCKERIGNORE_FILE: &str = ".dockerignore";
/// Archive name of a dockerfile that lives outside the context directory.
pub const EXTERNAL_DOCKERFILE_NAME: &str = ".dockerfile.external";

const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ContentSource {
    File(PathBuf),
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    File(ContentSource),
    Directory,
    Symlink(PathBuf),
}

/// A single member of the build context archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    path: String,
    mode: u32,
    size: u64,
    mtime: u64,
    kind: EntryKind,
}

impl ArchiveEntry {
    /// Path inside the archive, always relative and `/`-separated
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }
}

/// The surviving file set of a context directory, ready to be archived.
#[derive(Debug, Clone)]
pub struct BuildContext {
    entries: Vec<ArchiveEntry>,
    dockerfile_path: PathBuf,
    dockerfile_name: String,
}

impl BuildContext {
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Location of the dockerfile on disk
    pub fn dockerfile_path(&self) -> &Path {
        &self.dockerfile_path
    }

    /// Name of the dockerfile inside the archive, as passed to the daemon
    pub fn dockerfile_name(&self) -> &str {
        &self.dockerfile_name
    }

    /// Serializes the context as an uncompressed tar archive.
    ///
    /// Ownership is zeroed and mode and mtime come from the filesystem, so an
    /// unchanged tree always produces the same bytes.
    pub async fn to_tar(&self) -> Result<Vec<u8>, ContextError> {
        let mut tar = Builder::new(Vec::new());

        for entry in &self.entries {
            let mut header = Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_mtime(entry.mtime);
            header.set_uid(0);
            header.set_gid(0);

            match &entry.kind {
                EntryKind::Directory => {
                    tracing::trace!(path = entry.path, "Adding directory to tar");
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    tar.append_data(&mut header, &entry.path, tokio::io::empty())
                        .await?;
                }
                EntryKind::Symlink(target) => {
                    tracing::trace!(path = entry.path, target = ?target, "Adding symlink to tar");
                    header.set_entry_type(EntryType::Symlink);
                    header.set_link_name(target)?;
                    header.set_size(0);
                    tar.append_data(&mut header, &entry.path, tokio::io::empty())
                        .await?;
                }
                EntryKind::File(source) => {
                    tracing::trace!(path = entry.path, "Adding file to tar");
                    let content = match source {
                        ContentSource::Bytes(bytes) => bytes.to_vec(),
                        ContentSource::File(path) => {
                            let mut file = fs_err::tokio::File::open(path).await?;
                            let mut buffer_content = Vec::new();
                            file.read_to_end(&mut buffer_content).await?;
                            buffer_content
                        }
                    };

                    header.set_entry_type(EntryType::Regular);
                    header.set_size(content.len() as u64);
                    tar.append_data(&mut header, &entry.path, &*content).await?;
                }
            }
        }

        let archive = tar.into_inner().await?;
        tracing::debug!(
            entries = self.entries.len(),
            bytes = archive.len(),
            "Build context archived"
        );
        check_context_size(archive.len());

        Ok(archive)
    }

    /// Same as [`BuildContext::to_tar`], piped through gzip.
    pub async fn to_tar_gz(&self) -> Result<Vec<u8>, ContextError> {
        let archive = self.to_tar().await?;

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&archive)
            .map_err(ContextError::Compression)?;
        encoder.finish().map_err(ContextError::Compression)
    }
}

#[derive(Debug)]
pub struct ContextBuilder {
    context_path: PathBuf,
    ignore: IgnoreMatcher,
    dockerfile: PathBuf,
    force_include_dockerfile: bool,
}

impl ContextBuilder {
    /// Prepares a context rooted at `context_path`, compiling its `.dockerignore`.
    ///
    /// An invalid ignore file fails here, before anything is read or archived.
    pub fn from_path(context_path: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let path = context_path.into();
        let ignore = IgnoreMatcher::from_file(path.join(DOCKERIGNORE_FILE))?;

        Ok(Self {
            context_path: path,
            ignore,
            dockerfile: DEFAULT_DOCKERFILE.into(),
            force_include_dockerfile: false,
        })
    }

    /// Overwrite the dockerfile to use (default "Dockerfile"). Relative paths
    /// resolve against the context directory.
    pub fn with_dockerfile(&mut self, dockerfile: impl Into<PathBuf>) -> &mut Self {
        self.dockerfile = dockerfile.into();

        self
    }

    /// Replace the rules read from `.dockerignore`
    pub fn with_ignore(&mut self, ignore: IgnoreMatcher) -> &mut Self {
        self.ignore = ignore;

        self
    }

    /// Archive the dockerfile even when the ignore rules exclude it
    pub fn force_include_dockerfile(&mut self, force: bool) -> &mut Self {
        self.force_include_dockerfile = force;

        self
    }

    pub fn is_ignored(&self, relative_path: impl AsRef<Path>, is_dir: bool) -> bool {
        self.ignore.matches(relative_path, is_dir)
    }

    fn resolve_dockerfile(&self) -> PathBuf {
        if self.dockerfile.is_relative() {
            self.context_path.join(&self.dockerfile)
        } else {
            self.dockerfile.clone()
        }
    }

    /// Walks the context and collects every entry that survives the ignore rules.
    ///
    /// The dockerfile is validated before the walk starts.
    pub fn build(&self) -> Result<BuildContext, ContextError> {
        if !self.context_path.is_dir() {
            return Err(ContextError::ContextNotFound(self.context_path.clone()));
        }

        let dockerfile_path = self.resolve_dockerfile();
        if !dockerfile_path.is_file() {
            return Err(ContextError::MissingDockerfile(dockerfile_path));
        }

        let context_root = fs_err::canonicalize(&self.context_path)?;
        let canonical_dockerfile = fs_err::canonicalize(&dockerfile_path)?;

        // `inject` is set when the walk will not pick the dockerfile up by itself
        let (dockerfile_name, external, inject) =
            match canonical_dockerfile.strip_prefix(&context_root) {
                Ok(relative) => {
                    let name = archive_path(relative)?;
                    let excluded = self.is_ignored(relative, false);
                    if excluded && !self.force_include_dockerfile {
                        return Err(ContextError::DockerfileExcluded(name));
                    }
                    (name, false, excluded)
                }
                Err(_) => {
                    tracing::debug!(
                        dockerfile = ?dockerfile_path,
                        "dockerfile is outside the context, injecting it as {EXTERNAL_DOCKERFILE_NAME}"
                    );
                    (EXTERNAL_DOCKERFILE_NAME.to_string(), true, true)
                }
            };

        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.context_path)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_pruned(entry));

        for entry in walker {
            let entry = entry?;
            let relative_path = entry.path().strip_prefix(&self.context_path)?;
            let path = archive_path(relative_path)?;

            if external && path == dockerfile_name {
                tracing::warn!(path, "context entry shadowed by external dockerfile");
                continue;
            }

            let metadata = entry.metadata()?;
            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink(fs_err::read_link(entry.path())?)
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File(ContentSource::File(entry.path().to_path_buf()))
            } else {
                tracing::debug!(path, "skipping special file");
                continue;
            };

            let size = match kind {
                EntryKind::File(_) => metadata.len(),
                _ => 0,
            };

            entries.push(ArchiveEntry {
                path,
                mode: mode_of(&metadata),
                size,
                mtime: mtime_of(&metadata),
                kind,
            });
        }

        if inject {
            let content = fs_err::read(&dockerfile_path)?;
            let metadata = fs_err::metadata(&dockerfile_path)?;
            entries.push(ArchiveEntry {
                path: dockerfile_name.clone(),
                mode: mode_of(&metadata),
                size: content.len() as u64,
                mtime: mtime_of(&metadata),
                kind: EntryKind::File(ContentSource::Bytes(content.into())),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::debug!(
            context = ?self.context_path,
            entries = entries.len(),
            dockerfile = dockerfile_name,
            "Collected build context"
        );

        Ok(BuildContext {
            entries,
            dockerfile_path,
            dockerfile_name,
        })
    }

    fn is_pruned(&self, entry: &DirEntry) -> bool {
        let Ok(relative_path) = entry.path().strip_prefix(&self.context_path) else {
            return false;
        };

        let ignored = self.is_ignored(relative_path, entry.file_type().is_dir());
        if ignored {
            tracing::debug!(path = ?relative_path, "Ignored path");
        }
        ignored
    }
}

/// Converts a relative filesystem path to its `/`-separated archive form,
/// refusing anything that would leave the archive root.
fn archive_path(relative_path: &Path) -> Result<String, ContextError> {
    let mut parts = Vec::new();
    for component in relative_path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ContextError::PathEscapesRoot(relative_path.to_path_buf()));
            }
        }
    }

    if parts.is_empty() {
        return Err(ContextError::PathEscapesRoot(relative_path.to_path_buf()));
    }

    Ok(parts.join("/"))
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;

    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

fn mtime_of(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn check_context_size(size: usize) {
    if size > MAX_CONTEXT_SIZE {
        tracing::warn!(
            size_mb = size / 1024 / 1024,
            "Build context is very large, consider excluding files with .dockerignore"
        );
    }
}
