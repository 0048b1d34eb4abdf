use async_trait::async_trait;

use crate::{
    DockerStreamError, RequestDescriptor, frame_reader::Framing, handler::Completion,
    request::encode_path_segment,
};

use super::StreamedCommand;

/// `GET /containers/{id}/logs`. Output is delivered to the handler as raw
/// chunks tagged with their stream.
#[derive(Debug, Clone)]
pub struct LogContainer {
    container: String,
    follow: bool,
    stdout: bool,
    stderr: bool,
    timestamps: bool,
    tail: Option<String>,
    tty: bool,
}

impl LogContainer {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: None,
            tty: false,
        }
    }

    /// Keep streaming until the container stops
    pub fn follow(&mut self, follow: bool) -> &mut Self {
        self.follow = follow;

        self
    }

    pub fn stdout(&mut self, stdout: bool) -> &mut Self {
        self.stdout = stdout;

        self
    }

    pub fn stderr(&mut self, stderr: bool) -> &mut Self {
        self.stderr = stderr;

        self
    }

    pub fn timestamps(&mut self, timestamps: bool) -> &mut Self {
        self.timestamps = timestamps;

        self
    }

    /// Number of lines from the end, or `all`
    pub fn with_tail(&mut self, tail: impl Into<String>) -> &mut Self {
        self.tail = Some(tail.into());

        self
    }

    /// Containers with a tty send unframed output
    pub fn tty(&mut self, tty: bool) -> &mut Self {
        self.tty = tty;

        self
    }
}

#[async_trait]
impl StreamedCommand for LogContainer {
    type Extractor = Completion;

    async fn request(&self) -> Result<RequestDescriptor, DockerStreamError> {
        let framing = if self.tty {
            Framing::Raw
        } else {
            Framing::Multiplexed
        };

        Ok(RequestDescriptor::get(format!(
            "/containers/{}/logs",
            encode_path_segment(&self.container)
        ))
        .query_bool("follow", self.follow)
        .query_bool("stdout", self.stdout)
        .query_bool("stderr", self.stderr)
        .query_bool("timestamps", self.timestamps)
        .query_opt("tail", self.tail.clone())
        .framing(framing))
    }

    fn extractor(&self) -> Completion {
        Completion
    }
}
