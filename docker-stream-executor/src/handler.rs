//! Caller supplied callbacks and per-command result extraction.
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::{
    ExecutionError,
    execution::ExecutionState,
    frames::{ProgressEvent, RawChunk, StreamFrame},
};

/// Receives every frame of an execution, in arrival order, on the execution's task.
///
/// Calls are synchronous. A slow handler delays further frames of its own
/// execution and nothing else.
pub trait FrameHandler: Send + 'static {
    fn on_start(&mut self, _execution_id: Uuid) {}

    fn on_frame(&mut self, frame: &StreamFrame);

    /// Called once with the terminal state
    fn on_close(&mut self, _state: ExecutionState) {}
}

impl FrameHandler for () {
    fn on_frame(&mut self, _frame: &StreamFrame) {}
}

impl<H: FrameHandler + ?Sized> FrameHandler for Box<H> {
    fn on_start(&mut self, execution_id: Uuid) {
        (**self).on_start(execution_id);
    }

    fn on_frame(&mut self, frame: &StreamFrame) {
        (**self).on_frame(frame);
    }

    fn on_close(&mut self, state: ExecutionState) {
        (**self).on_close(state);
    }
}

#[derive(Debug, Clone)]
pub struct FnHandler<F>(F);

/// Wraps a closure as a [`FrameHandler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&StreamFrame) + Send + 'static,
{
    FnHandler(f)
}

impl<F> FrameHandler for FnHandler<F>
where
    F: FnMut(&StreamFrame) + Send + 'static,
{
    fn on_frame(&mut self, frame: &StreamFrame) {
        (self.0)(frame);
    }
}

/// Logs build output and errors through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingHandler {
    execution_id: Option<Uuid>,
}

impl FrameHandler for TracingHandler {
    fn on_start(&mut self, execution_id: Uuid) {
        self.execution_id = Some(execution_id);
    }

    fn on_frame(&mut self, frame: &StreamFrame) {
        match frame {
            StreamFrame::Progress(event) => {
                if let Some(text) = event.text() {
                    let text = text.trim_end();
                    if !text.is_empty() {
                        tracing::info!(id = event.id, "{text}");
                    }
                }
            }
            StreamFrame::Error(event) => {
                tracing::error!(kind = ?event.kind, code = event.code(), "{}", event.message);
            }
            StreamFrame::Raw(chunk) => {
                tracing::debug!(
                    channel = ?chunk.channel,
                    "{}",
                    String::from_utf8_lossy(&chunk.data).trim_end()
                );
            }
            StreamFrame::EndOfStream => tracing::debug!("End of stream"),
        }
    }

    fn on_close(&mut self, state: ExecutionState) {
        tracing::debug!(execution_id = ?self.execution_id, ?state, "Execution closed");
    }
}

/// Records every delivered frame. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectingHandler {
    frames: Arc<Mutex<Vec<StreamFrame>>>,
    closed_with: Arc<Mutex<Option<ExecutionState>>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<StreamFrame> {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn closed_with(&self) -> Option<ExecutionState> {
        *self
            .closed_with
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl FrameHandler for CollectingHandler {
    fn on_frame(&mut self, frame: &StreamFrame) {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(frame.clone());
    }

    fn on_close(&mut self, state: ExecutionState) {
        *self
            .closed_with
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(state);
    }
}

/// Derives a command's result from the frames of a successful stream.
pub trait ResultExtractor: Send + 'static {
    type Output: Send + 'static;

    fn observe(&mut self, event: &ProgressEvent);

    fn observe_raw(&mut self, _chunk: &RawChunk) {}

    /// Called after `EndOfStream`, only when no fatal error was seen.
    fn finish(self) -> Result<Self::Output, ExecutionError>;

    /// Whether an undecodable frame fails the execution
    fn malformed_frames_are_fatal(&self) -> bool {
        false
    }
}

/// Succeeds with `()` once the stream ends cleanly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion;

impl ResultExtractor for Completion {
    type Output = ();

    fn observe(&mut self, _event: &ProgressEvent) {}

    fn finish(self) -> Result<(), ExecutionError> {
        Ok(())
    }
}
