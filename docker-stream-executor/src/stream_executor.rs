use std::{sync::Arc, time::Duration};

use crate::{
    CommandExecution, DockerStreamError,
    client::DaemonTransport,
    commands::StreamedCommand,
    execution,
    handler::{FrameHandler, ResultExtractor, TracingHandler},
    transport::Transport,
};

type Output<C> = <<C as StreamedCommand>::Extractor as ResultExtractor>::Output;

/// Runs [`StreamedCommand`]s against a daemon.
#[derive(Debug, Clone)]
pub struct StreamExecutor {
    transport: Arc<dyn Transport>,
    default_timeout: Option<Duration>,
}

impl StreamExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            default_timeout: None,
        }
    }

    /// Uses the shared transport configured from the environment, the local
    /// docker socket unless `DOCKER_HOST` says otherwise.
    pub async fn connect() -> Result<Self, DockerStreamError> {
        let transport = DaemonTransport::shared().await?;
        let default_timeout = transport.config().default_timeout();

        Ok(Self {
            transport,
            default_timeout,
        })
    }

    /// Timeout used by [`StreamExecutor::run`]
    pub fn with_default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.default_timeout = Some(timeout);

        self
    }

    pub fn clear_default_timeout(&mut self) -> &mut Self {
        self.default_timeout = None;

        self
    }

    /// Starts `command`, delivering every frame to `handler`.
    ///
    /// The request is assembled first. If that fails, for example because the
    /// build context is invalid, nothing is sent.
    pub async fn execute<C, H>(
        &self,
        command: &C,
        handler: H,
    ) -> Result<CommandExecution<Output<C>>, DockerStreamError>
    where
        C: StreamedCommand,
        H: FrameHandler,
    {
        let request = command.request().await?;

        Ok(execution::start(
            Arc::clone(&self.transport),
            request,
            handler,
            command.extractor(),
        ))
    }

    /// Executes `command`, logging its output, and awaits the result.
    pub async fn run<C>(&self, command: &C) -> Result<Output<C>, DockerStreamError>
    where
        C: StreamedCommand,
    {
        let mut execution = self.execute(command, TracingHandler::default()).await?;

        Ok(execution.await_outcome(self.default_timeout).await?)
    }
}
