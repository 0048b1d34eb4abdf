use std::{fs, time::Duration};

use bytes::Bytes;
use indoc::indoc;
use serde_json::json;
use tempfile::tempdir;

use crate::{
    BuildImage, CollectingHandler, ContextError, DockerStreamError, ExecutionError,
    ExecutionState, Framing, LogContainer, OutputChannel, PullImage, PushImage, RawChunk,
    StreamExecutor, StreamFrame, WaitContainer,
    test_support::{ScriptedTransport, status_line},
};

fn build_output(lines: &[serde_json::Value]) -> Vec<Bytes> {
    lines.iter().cloned().map(status_line).collect()
}

fn context_dir(dockerignore: Option<&str>) -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("Dockerfile"),
        indoc! {"
            FROM busybox
            COPY . /app
        "},
    )
    .unwrap();
    fs::write(dir.path().join("main.sh"), "echo hello").unwrap();
    if let Some(rules) = dockerignore {
        fs::write(dir.path().join(".dockerignore"), rules).unwrap();
    }
    dir
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_build_resolves_last_image_id() {
    let dir = context_dir(None);
    let transport = ScriptedTransport::with_chunks(build_output(&[
        json!({"stream": "Step 1/2 : FROM busybox\n"}),
        json!({"stream": " ---> 1a2b3c\n"}),
        json!({"aux": {"ID": "sha256:first"}}),
        json!({"stream": "Step 2/2 : COPY . /app\n"}),
        json!({"aux": {"ID": "sha256:final"}}),
        json!({"stream": "Successfully tagged app:latest\n"}),
    ]));
    let executor = StreamExecutor::new(transport.clone());

    let mut build = BuildImage::from_directory(dir.path());
    build.with_tag("app:latest");

    let handler = CollectingHandler::new();
    let mut execution = executor.execute(&build, handler.clone()).await.unwrap();
    let image_id = execution.await_outcome(None).await.unwrap();

    assert_eq!(image_id, "sha256:final");
    assert_eq!(execution.state(), ExecutionState::Completed);
    assert_eq!(handler.frames().len(), 7);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/build");
    assert_eq!(requests[0].query_value("t"), Some("app:latest"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_build_error_frame_fails_execution() {
    let dir = context_dir(None);
    let transport = ScriptedTransport::with_chunks(build_output(&[
        json!({"stream": "Step 1/2 : FROM busybox\n"}),
        json!({
            "errorDetail": {"code": 1, "message": "The command '/bin/sh -c exit 1' returned a non-zero code: 1"},
            "error": "The command '/bin/sh -c exit 1' returned a non-zero code: 1"
        }),
        json!({"aux": {"ID": "sha256:never"}}),
    ]));
    let executor = StreamExecutor::new(transport);

    let handler = CollectingHandler::new();
    let mut execution = executor
        .execute(&BuildImage::from_directory(dir.path()), handler.clone())
        .await
        .unwrap();
    let err = execution.await_outcome(None).await.unwrap_err();

    assert!(
        matches!(&err, ExecutionError::RemoteOperation { message, code: Some(1) } if message.contains("non-zero code")),
        "{err:?}"
    );
    assert_eq!(execution.state(), ExecutionState::Failed);
    assert!(
        !handler
            .frames()
            .iter()
            .any(|frame| matches!(frame, StreamFrame::Progress(event) if event.image_id().is_some())),
        "no frame after the error may be dispatched"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_build_without_image_id() {
    let dir = context_dir(None);
    let transport = ScriptedTransport::with_chunks(build_output(&[json!({"stream": "Step 1/1\n"})]));

    let err = StreamExecutor::new(transport)
        .run(&BuildImage::from_directory(dir.path()))
        .await
        .unwrap_err();

    assert!(
        matches!(err, DockerStreamError::Execution(ExecutionError::NoResultFound(_))),
        "{err:?}"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_excluded_dockerfile_never_reaches_the_transport() {
    let dir = context_dir(Some("Dockerfile\n"));
    let transport = ScriptedTransport::with_chunks(Vec::<Bytes>::new());
    let executor = StreamExecutor::new(transport.clone());

    let err = executor
        .execute(&BuildImage::from_directory(dir.path()), ())
        .await
        .err()
        .unwrap();

    assert!(
        matches!(err, DockerStreamError::Context(ContextError::DockerfileExcluded(_))),
        "{err:?}"
    );
    assert!(transport.requests().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_invalid_dockerignore_never_reaches_the_transport() {
    let dir = context_dir(Some("*.log\n[unclosed\n"));
    let transport = ScriptedTransport::with_chunks(Vec::<Bytes>::new());
    let executor = StreamExecutor::new(transport.clone());

    let err = executor
        .execute(&BuildImage::from_directory(dir.path()), ())
        .await
        .err()
        .unwrap();

    assert!(
        matches!(err, DockerStreamError::Context(ContextError::Ignore(_))),
        "{err:?}"
    );
    assert!(transport.requests().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_force_included_dockerfile_builds() {
    let dir = context_dir(Some("Dockerfile\n"));
    let transport = ScriptedTransport::with_chunks(build_output(&[json!({"aux": {"ID": "sha256:ok"}})]));

    let mut build = BuildImage::from_directory(dir.path());
    build.force_include_dockerfile(true);

    let image_id = StreamExecutor::new(transport).run(&build).await.unwrap();
    assert_eq!(image_id, "sha256:ok");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_same_tree_uploads_identical_context() {
    let dir = context_dir(Some("*.log\n"));
    fs::write(dir.path().join("debug.log"), "noise").unwrap();
    fs::create_dir(dir.path().join("lib")).unwrap();
    fs::write(dir.path().join("lib/util.sh"), "true").unwrap();

    let build = BuildImage::from_directory(dir.path());
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let transport = ScriptedTransport::with_chunks(build_output(&[json!({"aux": {"ID": "sha256:x"}})]));
        StreamExecutor::new(transport.clone()).run(&build).await.unwrap();
        bodies.push(transport.requests().remove(0).body);
    }

    assert_eq!(bodies[0], bodies[1]);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_cancel_unblocks_waiting_caller() {
    let dir = context_dir(None);
    let (transport, tx) = ScriptedTransport::channel();
    let executor = StreamExecutor::new(transport);

    let mut execution = executor
        .execute(&BuildImage::from_directory(dir.path()), ())
        .await
        .unwrap();

    tx.send(Ok(status_line(json!({"stream": "Step 1/2 : FROM busybox\n"}))))
        .await
        .unwrap();
    execution
        .state_changes()
        .wait_for(|state| *state == ExecutionState::Streaming)
        .await
        .unwrap();

    let cancel = execution.cancel_handle();
    let waiter = tokio::spawn(async move {
        let result = execution.await_outcome(None).await;
        (result, execution.state())
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cancel.cancel());

    let (result, state) = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should unblock promptly")
        .unwrap();

    assert!(matches!(result, Err(ExecutionError::Cancelled)), "{result:?}");
    assert_eq!(state, ExecutionState::Cancelled);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_severed_stream_is_truncated() {
    let dir = context_dir(None);
    let transport = ScriptedTransport::with_chunks([
        status_line(json!({"stream": "Step 1/2 : FROM busybox\n"})),
        Bytes::from_static(b"{\"aux\":{\"ID\":\"sha256:"),
    ]);

    let err = StreamExecutor::new(transport)
        .run(&BuildImage::from_directory(dir.path()))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            DockerStreamError::Execution(ExecutionError::TruncatedStream { .. })
        ),
        "{err:?}"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_run_applies_default_timeout() {
    let (transport, _tx) = ScriptedTransport::channel();
    let mut executor = StreamExecutor::new(transport);
    executor.with_default_timeout(Duration::from_millis(50));

    let err = executor.run(&WaitContainer::new("sleepy")).await.unwrap_err();

    assert!(
        matches!(err, DockerStreamError::Execution(ExecutionError::Timeout(_))),
        "{err:?}"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_wait_returns_status_code() {
    let transport = ScriptedTransport::with_chunks([status_line(json!({"StatusCode": 0}))]);

    let code = StreamExecutor::new(transport.clone())
        .run(&WaitContainer::new("abc"))
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(
        transport.requests()[0].query_value("condition"),
        Some("not-running")
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_push_reports_digest() {
    let transport = ScriptedTransport::with_chunks(build_output(&[
        json!({"status": "The push refers to repository [localhost:5000/app]"}),
        json!({"status": "Pushed", "progressDetail": {}, "id": "5f70bf18a086"}),
        json!({"status": "latest: digest: sha256:cafe size: 528"}),
        json!({"progressDetail": {}, "aux": {"Tag": "latest", "Digest": "sha256:cafe", "Size": 528}}),
    ]));

    let mut push = PushImage::new("localhost:5000/app");
    push.with_tag("latest");
    let result = StreamExecutor::new(transport).run(&push).await.unwrap();

    assert_eq!(result.digest.as_deref(), Some("sha256:cafe"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_pull_auth_failure_is_remote_error() {
    let transport = ScriptedTransport::with_chunks(build_output(&[json!({
        "message": "pull access denied",
        "error": "pull access denied for private/app, repository does not exist or may require 'docker login'"
    })]));

    let err = StreamExecutor::new(transport)
        .run(&PullImage::new("private/app"))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, DockerStreamError::Execution(ExecutionError::RemoteOperation { message, .. }) if message.starts_with("pull access denied")),
        "{err:?}"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_logs_are_demultiplexed() {
    let transport = ScriptedTransport::with_chunks([
        Bytes::from_static(b"\x01\x00\x00\x00\x00\x00\x00\x06hello\n"),
        Bytes::from_static(b"\x02\x00\x00\x00\x00\x00\x00\x05oops\n"),
    ]);
    let handler = CollectingHandler::new();

    let mut logs = LogContainer::new("web");
    logs.follow(true);
    let execution = StreamExecutor::new(transport.clone())
        .execute(&logs, handler.clone())
        .await
        .unwrap();
    execution.wait().await.unwrap();

    assert_eq!(transport.requests()[0].framing, Framing::Multiplexed);
    assert_eq!(
        handler.frames(),
        vec![
            StreamFrame::Raw(RawChunk::new(OutputChannel::Stdout, &b"hello\n"[..])),
            StreamFrame::Raw(RawChunk::new(OutputChannel::Stderr, &b"oops\n"[..])),
            StreamFrame::EndOfStream,
        ]
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_concurrent_executions_are_independent() {
    let first = ScriptedTransport::with_chunks(build_output(&[json!({"StatusCode": 1})]));
    let (second, _tx) = ScriptedTransport::channel();

    let wait = WaitContainer::new("one");
    let mut slow = StreamExecutor::new(second)
        .execute(&WaitContainer::new("two"), ())
        .await
        .unwrap();

    let code = StreamExecutor::new(first).run(&wait).await.unwrap();
    assert_eq!(code, 1);
    assert_eq!(slow.state(), ExecutionState::Pending);

    slow.cancel();
    assert!(matches!(
        slow.await_outcome(None).await,
        Err(ExecutionError::Cancelled)
    ));
}
