//! Integration tests for `start_session` and the composite close handle.

mod common;

use common::{FailingStopFactory, RecordingUi, ScriptedCompiler, timed};
use liftoff_devserver::{
    AxumServerFactory, BroadcastCell, BuildTarget, BuildTargets, CompilerSession, DevServerError,
    DevServerStatus, ProxyConfig, ServerConfig, ServerFactory, SessionOptions, SessionParams,
    start_session,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

fn params(out: &TempDir, compiler: Arc<ScriptedCompiler>) -> SessionParams {
    SessionParams::new(
        BuildTarget::new("renderer", out.path()),
        ServerConfig::new("127.0.0.1", 0),
        compiler,
    )
}

#[tokio::test]
async fn test_empty_targets_are_rejected() {
    let compiler = Arc::new(ScriptedCompiler::default());
    let params = SessionParams::new(
        BuildTargets::from(Vec::new()),
        ServerConfig::new("127.0.0.1", 0),
        compiler.clone(),
    );

    let err = start_session(params).await.unwrap_err();
    assert!(matches!(err, DevServerError::NoTargets));
    assert_eq!(compiler.watches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_handle_is_idempotent() {
    let out = TempDir::new().unwrap();
    let compiler = Arc::new(ScriptedCompiler::default());
    let session = timed(start_session(params(&out, compiler.clone())))
        .await
        .unwrap();

    let handle = session.close_handle();
    let (a, b) = tokio::join!(handle.close(), session.close());
    a.unwrap();
    b.unwrap();
    assert!(handle.is_closed());

    timed(handle.close()).await.unwrap();
    assert_eq!(compiler.closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.status().get(), DevServerStatus::Closed);
}

#[tokio::test]
async fn test_stop_failure_is_reported_but_teardown_completes() {
    let out = TempDir::new().unwrap();
    let compiler = Arc::new(ScriptedCompiler::default());
    let factory = Arc::new(FailingStopFactory::default());
    let ui = Arc::new(RecordingUi::default());

    let config = ServerConfig::new("127.0.0.1", 0)
        .with_proxy(ProxyConfig::from_pairs([("/api", "http://localhost:9999")]));
    let params = SessionParams::new(BuildTarget::new("renderer", out.path()), config, compiler)
        .with_server_factory(factory.clone())
        .with_options(SessionOptions {
            interactive: true,
            ui: Some(ui.clone()),
            ..SessionOptions::default()
        });

    let session = timed(start_session(params)).await.unwrap();
    let log = session.proxy_log().unwrap();

    let err = timed(session.close()).await.unwrap_err();
    match err {
        DevServerError::Teardown(teardown) => {
            assert_eq!(teardown.errors().len(), 1);
            assert!(teardown.to_string().contains("simulated stop failure"));
        }
        other => panic!("expected teardown error, got {other}"),
    }

    assert_eq!(session.status().get(), DevServerStatus::Closed);
    assert!(log.is_closed());
    assert_eq!(ui.events.lock().last().map(String::as_str), Some("unmount"));

    // Second call waits on the finished teardown and doesn't stop again
    timed(session.close()).await.unwrap();
    assert_eq!(factory.stops(), 1);
}

#[tokio::test]
async fn test_ui_mounted_only_when_interactive() {
    let out = TempDir::new().unwrap();
    let ui = Arc::new(RecordingUi::default());

    let quiet = start_session(
        params(&out, Arc::new(ScriptedCompiler::default())).with_options(SessionOptions {
            interactive: false,
            ui: Some(ui.clone()),
            ..SessionOptions::default()
        }),
    )
    .await
    .unwrap();
    assert!(ui.events.lock().is_empty());
    quiet.close().await.unwrap();
    assert!(ui.events.lock().is_empty());

    let loud = start_session(
        params(&out, Arc::new(ScriptedCompiler::default())).with_options(SessionOptions {
            interactive: true,
            ui: Some(ui.clone()),
            ..SessionOptions::default()
        }),
    )
    .await
    .unwrap();
    assert_eq!(*ui.events.lock(), vec![format!("mount {}", loud.url())]);

    let feeds = ui.feeds.lock().clone().unwrap();
    assert_eq!(feeds.status.get(), DevServerStatus::Started);
    assert!(feeds.proxy_log.is_none());

    loud.close().await.unwrap();
    assert_eq!(ui.events.lock().len(), 2);
}

#[tokio::test]
async fn test_ui_exit_closes_session() {
    let out = TempDir::new().unwrap();
    let ui = Arc::new(RecordingUi::default());
    let restart = BroadcastCell::new("restart", Vec::<String>::new());

    let session = start_session(
        params(&out, Arc::new(ScriptedCompiler::default())).with_options(SessionOptions {
            interactive: true,
            ui: Some(ui.clone()),
            restart_alarm: Some(restart.reader()),
            ..SessionOptions::default()
        }),
    )
    .await
    .unwrap();

    let feeds = ui.feeds.lock().clone().unwrap();
    assert!(feeds.restart_alarm.is_some());
    (feeds.exit)();

    timed(session.session().wait_until_close()).await.unwrap();
    assert_eq!(session.status().get(), DevServerStatus::Closed);
    // Teardown finishes shortly after the session closes
    timed(session.close()).await.unwrap();
    assert!(session.close_handle().is_closed());
}

#[tokio::test]
async fn test_failed_ui_mount_closes_session() {
    let out = TempDir::new().unwrap();
    let compiler = Arc::new(ScriptedCompiler::default());
    let ui = Arc::new(RecordingUi {
        fail_mount: true,
        ..RecordingUi::default()
    });

    let err = timed(start_session(params(&out, compiler.clone()).with_options(
        SessionOptions {
            interactive: true,
            ui: Some(ui),
            ..SessionOptions::default()
        },
    )))
    .await
    .unwrap_err();

    assert!(matches!(err, DevServerError::Ui(_)));
    assert_eq!(compiler.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_waiters_before_and_after_start() {
    let out = TempDir::new().unwrap();
    let compiler = Arc::new(ScriptedCompiler::default());
    let server = AxumServerFactory
        .create(ServerConfig::new("127.0.0.1", 0))
        .unwrap();
    let session = CompilerSession::new(
        BuildTarget::new("renderer", out.path()),
        compiler,
        server,
    );

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.wait_until_start().await }
    });
    let second = tokio::spawn({
        let session = session.clone();
        async move { session.wait_until_start().await }
    });
    tokio::task::yield_now().await;

    timed(session.start()).await.unwrap();
    timed(first).await.unwrap().unwrap();
    timed(second).await.unwrap().unwrap();

    // Already started: resolves immediately
    timed(session.wait_until_start()).await.unwrap();

    assert!(session.close());
    timed(session.wait_until_close()).await.unwrap();
    assert_eq!(session.current_status(), DevServerStatus::Closed);
}
