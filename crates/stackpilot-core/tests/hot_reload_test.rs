//! Hot-reload sessions with a shell script standing in for `dotnet watch`.

use std::sync::Arc;
use std::time::Duration;

use stackpilot_core::RuntimeError;
use stackpilot_core::hot_reload::{HotReloadManager, HotReloadOptions, SessionStatus, WatchCommand};
use stackpilot_core::logs::{LogRole, LogRouter};
use stackpilot_core::provider::RunRequest;
use stackpilot_test_utils::{TestApp, scripted_orchestrator, test_kernel};

fn manager(script: &str) -> (HotReloadManager, Arc<LogRouter>) {
    let router = Arc::new(LogRouter::new(200));
    let command = WatchCommand {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        dotnet_flags: false,
        prebuild: false,
    };
    (
        HotReloadManager::new(test_kernel(), router.clone(), command, Duration::from_secs(5)),
        router,
    )
}

fn options(app: &TestApp, app_id: u64) -> HotReloadOptions {
    HotReloadOptions {
        app_id,
        app_path: app.path().to_path_buf(),
        ..HotReloadOptions::default()
    }
}

async fn wait_for_status(manager: &HotReloadManager, app_id: u64, status: SessionStatus) -> Option<SessionStatus> {
    for _ in 0..100 {
        let current = manager.status(app_id).map(|s| s.status);
        if current == Some(status) {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.status(app_id).map(|s| s.status)
}

#[tokio::test]
async fn second_start_while_active_is_an_error_and_keeps_one_session() {
    let (manager, _router) = manager("exec sleep 30");
    let app = TestApp::empty();

    let first = manager.start(options(&app, 1)).await.unwrap();
    assert_eq!(first.status, SessionStatus::Active);
    assert!(first.process_id.is_some());

    let err = manager.start(options(&app, 1)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::SessionActive(1)));

    let sessions = manager.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Active);
    assert_eq!(sessions[0].process_id, first.process_id);
    manager.shutdown().await;
}

#[tokio::test]
async fn stop_ends_in_stopped_and_allows_a_fresh_session() {
    let (manager, router) = manager("exec sleep 30");
    let app = TestApp::empty();

    manager.start(options(&app, 2)).await.unwrap();
    manager.stop(2).await.unwrap();
    let session = manager.status(2).unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert!(session.process_id.is_none());
    assert!(!manager.is_active(2));
    assert!(
        router
            .logs(2, LogRole::System)
            .iter()
            .any(|e| e.text == "hot reload session stopped")
    );

    let again = manager.start(options(&app, 2)).await.unwrap();
    assert_eq!(again.status, SessionStatus::Active);
    manager.shutdown().await;
}

#[tokio::test]
async fn stopping_without_a_session_is_a_no_op() {
    let (manager, _router) = manager("exec sleep 30");
    manager.stop(42).await.unwrap();
    assert!(manager.status(42).is_none());
}

#[tokio::test]
async fn watcher_output_updates_the_session() {
    let script = "echo 'dotnet watch: Hot reload of changes succeeded.'; \
                  echo 'File changed: MainWindow.xaml'; \
                  echo 'MainWindow.xaml.cs(3,1): error CS1002: ; expected' >&2; \
                  exec sleep 30";
    let (manager, router) = manager(script);
    let app = TestApp::empty();

    manager.start(options(&app, 3)).await.unwrap();
    let mut session = manager.status(3).unwrap();
    for _ in 0..100 {
        if session.reload_count >= 2 && session.error.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        session = manager.status(3).unwrap();
    }
    assert_eq!(session.reload_count, 2);
    assert!(session.last_reload_at.is_some());
    assert!(session.error.unwrap().contains("CS1002"));
    assert_eq!(session.status, SessionStatus::Active);

    let system = router.logs(3, LogRole::System);
    assert!(system.iter().any(|e| e.text.contains("File changed")));
    manager.shutdown().await;
}

#[tokio::test]
async fn watcher_exit_code_decides_stopped_or_failed() {
    let (clean, _) = manager("sleep 0.2; exit 0");
    let (crashed, _) = manager("sleep 0.2; exit 7");
    let app = TestApp::empty();

    clean.start(options(&app, 4)).await.unwrap();
    crashed.start(options(&app, 4)).await.unwrap();

    assert_eq!(wait_for_status(&clean, 4, SessionStatus::Stopped).await, Some(SessionStatus::Stopped));
    assert_eq!(wait_for_status(&crashed, 4, SessionStatus::Failed).await, Some(SessionStatus::Failed));
    assert!(crashed.status(4).unwrap().error.unwrap().contains("code 7"));
}

#[tokio::test]
async fn orchestrator_refuses_hot_reload_for_a_web_app() {
    let (orchestrator, _runtimes) = scripted_orchestrator("exec sleep 30");
    let app = TestApp::node();

    assert!(!orchestrator.check_hot_reload_support("react").supported);
    assert!(orchestrator.check_hot_reload_support("wpf").supported);

    assert!(
        orchestrator
            .run_app(RunRequest::new(5, app.path(), "web"))
            .await
            .unwrap()
            .ready
    );
    let err = orchestrator
        .start_hot_reload(options(&app, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Unsupported(_)));
    assert!(orchestrator.get_hot_reload_status(5).session.is_none());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn orchestrator_reports_session_status() {
    let (orchestrator, _runtimes) = scripted_orchestrator("exec sleep 30");
    let app = TestApp::wpf("Demo");

    orchestrator.start_hot_reload(options(&app, 6)).await.unwrap();
    let status = orchestrator.get_hot_reload_status(6);
    assert_eq!(status.status, Some(SessionStatus::Active));
    assert_eq!(status.session.unwrap().app_id, 6);

    orchestrator.stop_hot_reload(6).await.unwrap();
    assert_eq!(
        orchestrator.get_hot_reload_status(6).status,
        Some(SessionStatus::Stopped)
    );
}
