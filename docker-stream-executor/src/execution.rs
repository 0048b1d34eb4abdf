//! Drives a streamed command from request to terminal outcome.
//!
//! Each call to [`start`] spawns one task that issues the request, reads
//! frames, hands them to the caller's [`FrameHandler`] and feeds a
//! [`ResultExtractor`]. The outcome is delivered once, over a oneshot channel,
//! to whoever awaits the returned [`CommandExecution`].
use std::{sync::Arc, time::Duration};

use futures_util::StreamExt as _;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::{
    ExecutionError, RequestDescriptor,
    frame_reader::FrameReader,
    frames::{ErrorKind, StreamFrame},
    handler::{FrameHandler, ResultExtractor},
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }
}

/// Moves to `next` unless the current state is terminal or already `next`.
fn transition(state: &watch::Sender<ExecutionState>, next: ExecutionState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            return false;
        }
        tracing::trace!(from = ?current, to = ?next, "State transition");
        *current = next;
        true
    })
}

/// Cancels an execution from anywhere. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<watch::Sender<ExecutionState>>,
    token: CancellationToken,
}

impl CancelHandle {
    /// Returns false when the execution had already reached a terminal state.
    pub fn cancel(&self) -> bool {
        let cancelled = transition(&self.state, ExecutionState::Cancelled);
        if cancelled {
            self.token.cancel();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle to one in-flight streamed command.
///
/// Dropping it before a terminal state cancels the execution.
#[derive(Debug)]
pub struct CommandExecution<T> {
    id: Uuid,
    state: watch::Receiver<ExecutionState>,
    cancel: CancelHandle,
    outcome: Option<oneshot::Receiver<Result<T, ExecutionError>>>,
}

impl<T> CommandExecution<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change of this execution
    pub fn state_changes(&self) -> watch::Receiver<ExecutionState> {
        self.state.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Suspends until the execution reaches a terminal state.
    ///
    /// A cancellation unblocks the caller immediately with
    /// [`ExecutionError::Cancelled`]. Hitting `timeout` returns
    /// [`ExecutionError::Timeout`] and leaves the execution running, so the
    /// outcome can still be awaited later. Once an outcome has been returned,
    /// further calls fail with [`ExecutionError::OutcomeConsumed`].
    pub async fn await_outcome(&mut self, timeout: Option<Duration>) -> Result<T, ExecutionError> {
        let Some(outcome) = self.outcome.as_mut() else {
            return Err(ExecutionError::OutcomeConsumed);
        };
        let token = self.cancel.token.clone();

        let wait = async {
            tokio::select! {
                biased;

                () = token.cancelled() => Err(ExecutionError::Cancelled),
                received = outcome => received.unwrap_or_else(|_| Err(ExecutionError::Abandoned)),
            }
        };

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(execution_id = %self.id, ?limit, "Timed out awaiting outcome");
                    return Err(ExecutionError::Timeout(limit));
                }
            },
            None => wait.await,
        };

        self.outcome = None;
        result
    }

    /// Awaits the outcome without a timeout, consuming the handle.
    pub async fn wait(mut self) -> Result<T, ExecutionError> {
        self.await_outcome(None).await
    }
}

impl<T> Drop for CommandExecution<T> {
    fn drop(&mut self) {
        if self.cancel.cancel() {
            tracing::debug!(execution_id = %self.id, "Execution dropped before completion, cancelled");
        }
    }
}

/// Spawns the execution of `request` on the current tokio runtime.
pub fn start<H, X>(
    transport: Arc<dyn Transport>,
    request: RequestDescriptor,
    mut handler: H,
    extractor: X,
) -> CommandExecution<X::Output>
where
    H: FrameHandler,
    X: ResultExtractor,
{
    let id = Uuid::new_v4();
    let (state_tx, state_rx) = watch::channel(ExecutionState::Pending);
    let state_tx = Arc::new(state_tx);
    let token = CancellationToken::new();
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let span = tracing::info_span!(
        "stream_execution",
        execution_id = %id,
        method = %request.method,
        path = %request.path
    );

    let task_state = Arc::clone(&state_tx);
    let task_token = token.clone();
    tokio::spawn(
        async move {
            handler.on_start(id);

            let result = tokio::select! {
                biased;

                () = task_token.cancelled() => Err(ExecutionError::Cancelled),
                result = drive(transport.as_ref(), request, &mut handler, extractor, &task_state) => result,
            };

            let terminal = match &result {
                Ok(_) => ExecutionState::Completed,
                Err(ExecutionError::Cancelled) => ExecutionState::Cancelled,
                Err(_) => ExecutionState::Failed,
            };
            transition(&task_state, terminal);

            // a cancel that landed first wins over whatever the stream produced
            let final_state = *task_state.borrow();
            let result = if final_state == ExecutionState::Cancelled {
                Err(ExecutionError::Cancelled)
            } else {
                result
            };

            match &result {
                Ok(_) => tracing::debug!("Execution completed"),
                Err(ExecutionError::Cancelled) => tracing::debug!("Execution cancelled"),
                Err(err) => tracing::warn!(error = %err, "Execution failed"),
            }

            handler.on_close(final_state);
            if outcome_tx.send(result).is_err() {
                tracing::trace!("Outcome receiver dropped");
            }
        }
        .instrument(span),
    );

    CommandExecution {
        id,
        state: state_rx,
        cancel: CancelHandle {
            state: state_tx,
            token,
        },
        outcome: Some(outcome_rx),
    }
}

async fn drive<H, X>(
    transport: &dyn Transport,
    request: RequestDescriptor,
    handler: &mut H,
    mut extractor: X,
    state: &Arc<watch::Sender<ExecutionState>>,
) -> Result<X::Output, ExecutionError>
where
    H: FrameHandler,
    X: ResultExtractor,
{
    let framing = request.framing;
    tracing::debug!(?framing, body = request.body.len(), "Issuing request");
    let body = transport.execute(request).await?;

    let streaming = Arc::clone(state);
    let body = body.inspect(move |chunk| {
        if chunk.is_ok() && *streaming.borrow() == ExecutionState::Pending {
            transition(&streaming, ExecutionState::Streaming);
        }
    });

    let mut frames = FrameReader::new(body, framing);
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        handler.on_frame(&frame);

        match frame {
            StreamFrame::Progress(event) => extractor.observe(&event),
            StreamFrame::Raw(chunk) => extractor.observe_raw(&chunk),
            StreamFrame::Error(event) => match event.kind {
                ErrorKind::Remote => {
                    return Err(ExecutionError::RemoteOperation {
                        code: event.code(),
                        message: event.message,
                    });
                }
                ErrorKind::Malformed if extractor.malformed_frames_are_fatal() => {
                    return Err(ExecutionError::MalformedFrame(event.message));
                }
                ErrorKind::Malformed => {
                    tracing::warn!(reason = event.message, "Ignoring malformed frame");
                }
            },
            StreamFrame::EndOfStream => break,
        }
    }

    extractor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        TransportError,
        frames::ProgressEvent,
        handler::CollectingHandler,
        test_support::{ScriptedTransport, status_line},
    };
    use bytes::Bytes;
    use serde_json::json;

    /// Result is the last status seen
    #[derive(Default)]
    struct LastStatus {
        last: Option<String>,
        strict: bool,
    }

    impl ResultExtractor for LastStatus {
        type Output = String;

        fn observe(&mut self, event: &ProgressEvent) {
            if let Some(status) = &event.status {
                self.last = Some(status.clone());
            }
        }

        fn finish(self) -> Result<String, ExecutionError> {
            self.last
                .ok_or_else(|| ExecutionError::NoResultFound("no status".into()))
        }

        fn malformed_frames_are_fatal(&self) -> bool {
            self.strict
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_completes_with_extracted_result() {
        let transport = ScriptedTransport::with_chunks([
            status_line(json!({"status": "one"})),
            status_line(json!({"status": "two"})),
        ]);
        let handler = CollectingHandler::new();

        let mut execution = start(
            transport,
            RequestDescriptor::post("/test"),
            handler.clone(),
            LastStatus::default(),
        );

        assert_eq!(execution.await_outcome(None).await.unwrap(), "two");
        assert_eq!(execution.state(), ExecutionState::Completed);
        assert_eq!(handler.frames().len(), 3);
        assert_eq!(handler.frames().last(), Some(&StreamFrame::EndOfStream));
        assert_eq!(handler.closed_with(), Some(ExecutionState::Completed));
    }

    #[test_log::test(tokio::test)]
    async fn test_remote_error_stops_dispatch() {
        let transport = ScriptedTransport::with_chunks([
            status_line(json!({"status": "one"})),
            status_line(json!({"error": "boom", "errorDetail": {"code": 7, "message": "boom"}})),
            status_line(json!({"status": "after"})),
        ]);
        let handler = CollectingHandler::new();

        let err = start(
            transport,
            RequestDescriptor::post("/test"),
            handler.clone(),
            LastStatus::default(),
        )
        .wait()
        .await
        .unwrap_err();

        assert!(
            matches!(&err, ExecutionError::RemoteOperation { message, code: Some(7) } if message == "boom"),
            "{err:?}"
        );
        let frames = handler.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_error());
        assert_eq!(handler.closed_with(), Some(ExecutionState::Failed));
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_frames_are_reported_not_fatal() {
        let transport = ScriptedTransport::with_chunks([
            Bytes::from_static(b"{oops}\n"),
            status_line(json!({"status": "fine"})),
        ]);
        let handler = CollectingHandler::new();

        let mut execution = start(
            transport,
            RequestDescriptor::post("/test"),
            handler.clone(),
            LastStatus::default(),
        );

        assert_eq!(execution.await_outcome(None).await.unwrap(), "fine");
        assert!(handler.frames()[0].is_error());
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_frames_can_be_fatal() {
        let transport = ScriptedTransport::with_chunks([
            Bytes::from_static(b"{oops}\n"),
            status_line(json!({"status": "fine"})),
        ]);

        let err = start(
            transport,
            RequestDescriptor::post("/test"),
            (),
            LastStatus {
                strict: true,
                ..Default::default()
            },
        )
        .wait()
        .await
        .unwrap_err();

        assert!(matches!(err, ExecutionError::MalformedFrame(_)), "{err:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_clean_stream_without_result() {
        let transport = ScriptedTransport::with_chunks([status_line(json!({"stream": "hi"}))]);

        let err = start(
            transport,
            RequestDescriptor::post("/test"),
            (),
            LastStatus::default(),
        )
        .wait()
        .await
        .unwrap_err();

        assert!(matches!(err, ExecutionError::NoResultFound(_)), "{err:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_transport_error_fails_execution() {
        let transport = ScriptedTransport::failing(TransportError::Status {
            status: 404,
            message: "no such image".into(),
        });

        let mut execution = start(
            transport,
            RequestDescriptor::post("/test"),
            (),
            LastStatus::default(),
        );
        let err = execution.await_outcome(None).await.unwrap_err();

        assert!(
            matches!(err, ExecutionError::Transport(TransportError::Status { status: 404, .. })),
            "{err:?}"
        );
        assert_eq!(execution.state(), ExecutionState::Failed);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_unblocks_waiter() {
        let (transport, tx) = ScriptedTransport::channel();
        tx.send(Ok(status_line(json!({"status": "one"}))))
            .await
            .unwrap();

        let handler = CollectingHandler::new();
        let mut execution = start(
            transport,
            RequestDescriptor::post("/test"),
            handler.clone(),
            LastStatus::default(),
        );
        execution
            .state_changes()
            .wait_for(|state| *state == ExecutionState::Streaming)
            .await
            .unwrap();

        let cancel = execution.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = execution
            .await_outcome(Some(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Cancelled), "{err:?}");
        assert_eq!(execution.state(), ExecutionState::Cancelled);

        // the body is released once the task observes the cancellation
        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .unwrap();
        while handler.closed_with().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.closed_with(), Some(ExecutionState::Cancelled));
    }

    #[test_log::test(tokio::test)]
    async fn test_timeout_keeps_execution_running() {
        let (transport, tx) = ScriptedTransport::channel();
        let mut execution = start(
            transport,
            RequestDescriptor::post("/test"),
            (),
            LastStatus::default(),
        );

        let err = execution
            .await_outcome(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)), "{err:?}");
        assert!(!execution.state().is_terminal());

        tx.send(Ok(status_line(json!({"status": "late"}))))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(execution.await_outcome(None).await.unwrap(), "late");
        assert!(matches!(
            execution.await_outcome(None).await,
            Err(ExecutionError::OutcomeConsumed)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_after_completion_is_noop() {
        let transport = ScriptedTransport::with_chunks([status_line(json!({"status": "done"}))]);
        let mut execution = start(
            transport,
            RequestDescriptor::post("/test"),
            (),
            LastStatus::default(),
        );

        assert_eq!(execution.await_outcome(None).await.unwrap(), "done");
        assert!(!execution.cancel());
        assert_eq!(execution.state(), ExecutionState::Completed);
    }

    #[test_log::test(tokio::test)]
    async fn test_dropping_execution_cancels_it() {
        let (transport, tx) = ScriptedTransport::channel();
        let execution = start(
            transport,
            RequestDescriptor::post("/test"),
            (),
            LastStatus::default(),
        );
        let mut states = execution.state_changes();

        drop(execution);

        states
            .wait_for(|state| *state == ExecutionState::Cancelled)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), tx.closed())
            .await
            .unwrap();
    }
}
