//! Lifecycle and correlation tests for `WorkerSession`
//!
//! Every test drives the `facenet-stub-worker` binary built from this
//! package, so no Python environment is needed.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{stub_config, wait_for};
use facenet_bridge::{
    BridgeCall, BridgeError, CodecError, IsolatedEnv, SessionConfig, SessionState, WorkerSession,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn echo(value: impl Into<Value>, delay_ms: u64) -> BridgeCall {
    BridgeCall::new("echo").with_value(value).with_value(delay_ms)
}

#[tokio::test]
async fn test_start_transitions_to_ready() {
    let session = WorkerSession::new(stub_config());
    assert_eq!(session.state(), SessionState::Created);
    assert!(matches!(
        session.invoke(&echo("early", 0)).await,
        Err(BridgeError::NotStarted)
    ));

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.pid().is_some());
    assert!(session.is_alive().await);

    // Starting a running session changes nothing
    let pid = session.pid();
    session.start().await.unwrap();
    assert_eq!(session.pid(), pid);

    assert_eq!(session.invoke(&echo("hello", 0)).await.unwrap(), json!("hello"));
    session.quit().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_quit_twice_does_not_fail_or_hang() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(10), session.quit())
            .await
            .expect("quit hung")
            .unwrap();
    }

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(session.pid().is_none());
    assert!(!session.is_alive().await);
}

#[tokio::test]
async fn test_call_after_quit_fails_with_crashed() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();
    session.quit().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), session.invoke(&echo(1, 0)))
        .await
        .expect("call after quit hung");
    assert!(matches!(result, Err(BridgeError::WorkerCrashed(_))));

    assert!(matches!(session.start().await, Err(BridgeError::WorkerCrashed(_))));
}

#[tokio::test]
async fn test_quit_before_start() {
    let session = WorkerSession::new(stub_config());
    session.quit().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(session.start().await, Err(BridgeError::WorkerCrashed(_))));
}

#[tokio::test]
async fn test_calls_complete_in_issue_order() {
    let session = Arc::new(WorkerSession::spawn(stub_config()).await.unwrap());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let slow = {
        let session = Arc::clone(&session);
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = session.invoke(&echo("A", 300)).await;
            done_tx.send("A").unwrap();
            result
        })
    };
    wait_for(|| session.state() == SessionState::Busy).await;

    // B would finish immediately, but it has to wait for A's reply
    let fast = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            let result = session.invoke(&echo("B", 0)).await;
            done_tx.send("B").unwrap();
            result
        })
    };
    wait_for(|| session.pending_calls() == 2).await;

    assert_eq!(slow.await.unwrap().unwrap(), json!("A"));
    assert_eq!(fast.await.unwrap().unwrap(), json!("B"));
    assert_eq!(done_rx.recv().await, Some("A"));
    assert_eq!(done_rx.recv().await, Some("B"));

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.pending_calls(), 0);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_try_invoke_reports_busy() {
    let session = Arc::new(WorkerSession::spawn(stub_config()).await.unwrap());

    let slow = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.invoke(&echo("slow", 300)).await })
    };
    wait_for(|| session.state() == SessionState::Busy).await;

    assert!(matches!(
        session.try_invoke(&echo("eager", 0)).await,
        Err(BridgeError::WorkerBusy)
    ));

    assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
    assert_eq!(session.try_invoke(&echo("idle", 0)).await.unwrap(), json!("idle"));
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_json_worker_logs_stay_off_the_pipe() {
    let config = stub_config()
        .with_env("FACENET_LOG_FORMAT", "json")
        .with_env("RUST_LOG", "debug");
    let session = WorkerSession::spawn(config).await.unwrap();

    // Every call logs on the worker side
    assert_eq!(session.invoke(&BridgeCall::new("init_mtcnn")).await.unwrap(), Value::Null);
    for value in ["one", "two"] {
        assert_eq!(session.invoke(&echo(value, 0)).await.unwrap(), json!(value));
    }

    assert_eq!(session.state(), SessionState::Ready);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_malformed_reply_keeps_session_usable() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();

    let result = session.invoke(&BridgeCall::new("garbage")).await;
    assert!(matches!(result, Err(BridgeError::Codec(CodecError::Json(_)))));
    assert_eq!(session.state(), SessionState::Ready);

    assert_eq!(session.invoke(&echo(vec![1, 2, 3], 0)).await.unwrap(), json!([1, 2, 3]));
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_worker_failure_is_per_call() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();

    match session.invoke(&BridgeCall::new("no_such_method")).await {
        Err(BridgeError::Remote { method, message }) => {
            assert_eq!(method, "no_such_method");
            assert!(message.contains("unknown method"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.invoke(&echo("still here", 0)).await.unwrap(), json!("still here"));
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_oversized_reply_keeps_session_usable() {
    let session = WorkerSession::spawn(stub_config().with_max_frame_bytes(64))
        .await
        .unwrap();

    let result = session.invoke(&echo("x".repeat(200), 0)).await;
    assert!(matches!(
        result,
        Err(BridgeError::Codec(CodecError::FrameTooLarge { limit: 64, .. }))
    ));

    assert_eq!(session.invoke(&echo("ok", 0)).await.unwrap(), json!("ok"));
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_crash_fails_all_pending_calls() {
    let session = Arc::new(WorkerSession::spawn(stub_config()).await.unwrap());

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.invoke(&echo("before crash", 200)).await })
    };
    wait_for(|| session.state() == SessionState::Busy).await;

    let crash = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.invoke(&BridgeCall::new("crash").with_value(7)).await })
    };
    wait_for(|| session.pending_calls() == 2).await;

    let queued = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.invoke(&echo("after crash", 0)).await })
    };
    wait_for(|| session.pending_calls() == 3).await;

    assert_eq!(first.await.unwrap().unwrap(), json!("before crash"));
    assert!(matches!(crash.await.unwrap(), Err(BridgeError::WorkerCrashed(_))));
    assert!(matches!(queued.await.unwrap(), Err(BridgeError::WorkerCrashed(_))));

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(!session.is_alive().await);
    assert!(matches!(
        session.invoke(&echo("later", 0)).await,
        Err(BridgeError::WorkerCrashed(_))
    ));

    // quit on a crashed session degrades to a no-op
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_timeout_discards_session() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();

    let result = session
        .invoke_with_timeout(&echo("too slow", 2_000), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(BridgeError::Timeout(_))));
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(session.pid().is_none());

    assert!(matches!(
        session.invoke(&echo("next", 0)).await,
        Err(BridgeError::WorkerCrashed(_))
    ));
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_configured_call_timeout_applies_to_invoke() {
    let config = stub_config().with_call_timeout(Duration::from_millis(100));
    let session = WorkerSession::spawn(config).await.unwrap();

    assert_eq!(session.invoke(&echo("quick", 0)).await.unwrap(), json!("quick"));
    assert!(matches!(
        session.invoke(&echo("slow", 2_000)).await,
        Err(BridgeError::Timeout(_))
    ));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_dropped_call_abandons_session() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();

    let abandoned = echo("abandoned", 500);
    tokio::select! {
        _ = session.invoke(&abandoned) => panic!("call should still be in flight"),
        () = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        session.invoke(&echo("next", 0)).await,
        Err(BridgeError::WorkerCrashed(_))
    ));

    // quit still reaps the abandoned worker
    tokio::time::timeout(Duration::from_secs(5), session.quit())
        .await
        .expect("quit hung")
        .unwrap();
    assert!(!session.is_alive().await);
}

#[tokio::test]
async fn test_quit_while_busy_kills_worker() {
    let session = Arc::new(WorkerSession::spawn(stub_config()).await.unwrap());

    let in_flight = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.invoke(&echo("never answered", 5_000)).await })
    };
    wait_for(|| session.state() == SessionState::Busy).await;

    tokio::time::timeout(Duration::from_secs(2), session.quit())
        .await
        .expect("quit waited for the busy worker")
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("in-flight call hung")
        .unwrap();
    assert!(matches!(result, Err(BridgeError::WorkerCrashed(_))));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_spawn_failure() {
    let session = WorkerSession::new(SessionConfig::for_program("/nonexistent/facenet-worker"));
    assert!(matches!(session.start().await, Err(BridgeError::Spawn(_))));
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        session.invoke(&echo(1, 0)).await,
        Err(BridgeError::WorkerCrashed(_))
    ));
}

#[tokio::test]
async fn test_missing_environment_prevents_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = stub_config().with_environment(IsolatedEnv::new(dir.path().join("missing")));

    let session = WorkerSession::new(config);
    assert!(matches!(
        session.start().await,
        Err(BridgeError::EnvironmentNotFound(_))
    ));
    assert_eq!(session.state(), SessionState::Created);
    assert!(session.pid().is_none());
}

#[tokio::test]
async fn test_worker_sees_isolated_environment() {
    let dir = tempfile::tempdir().unwrap();
    let environment = IsolatedEnv::new(dir.path());
    std::fs::create_dir_all(environment.bin_dir()).unwrap();

    let config = stub_config()
        .with_environment(environment.clone())
        .with_env("PYTHONHOME", "/usr");
    let session = WorkerSession::spawn(config).await.unwrap();

    let env_var = |name: &'static str| BridgeCall::new("env").with_value(name);

    let active = session.invoke(&env_var("VIRTUAL_ENV")).await.unwrap();
    assert_eq!(active, json!(environment.root().display().to_string()));

    let path = session.invoke(&env_var("PATH")).await.unwrap();
    let root = environment.root().display().to_string();
    assert!(path.as_str().unwrap().starts_with(&root));

    let home = session.invoke(&env_var("PYTHONHOME")).await.unwrap();
    assert_eq!(home, Value::Null);

    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_independent_sessions() {
    let (a, b) = tokio::join!(
        WorkerSession::spawn(stub_config()),
        WorkerSession::spawn(stub_config())
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.pid(), b.pid());

    let (req_a, req_b) = (echo("a", 100), echo("b", 100));
    let (ra, rb) = tokio::join!(a.invoke(&req_a), b.invoke(&req_b));
    assert_eq!(ra.unwrap(), json!("a"));
    assert_eq!(rb.unwrap(), json!("b"));

    a.quit().await.unwrap();
    assert_eq!(b.invoke(&echo("b still up", 0)).await.unwrap(), json!("b still up"));
    b.quit().await.unwrap();
}

/// `true` once `pid` has exited (gone, or a zombie awaiting reaping).
#[cfg(target_os = "linux")]
fn process_exited(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).map_or(true, |stat| {
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state == 'Z' || state == 'X')
    })
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropping_live_session_kills_worker() {
    let session = WorkerSession::spawn(stub_config()).await.unwrap();
    assert_eq!(session.invoke(&echo("alive", 0)).await.unwrap(), json!("alive"));
    let pid = session.pid().unwrap();
    assert!(!process_exited(pid));

    drop(session);
    wait_for(|| process_exited(pid)).await;
}
