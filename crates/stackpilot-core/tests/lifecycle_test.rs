//! Run/stop state machine driven through the orchestrator with scripted
//! providers. Every process is a real `sh` script under the kernel.

use std::time::Duration;

use stackpilot_core::RuntimeError;
use stackpilot_core::lifecycle::AppState;
use stackpilot_core::orchestrator::Orchestrator;
use stackpilot_core::provider::{BuildConfiguration, BuildRequest, RunRequest};
use stackpilot_test_utils::{READY_LINE, TestApp, scripted_orchestrator};

const IDLE_WATCH: &str = "exec sleep 30";

/// Poll until the app reaches `state` or five seconds pass.
async fn wait_for_state(orchestrator: &Orchestrator, app_id: u64, state: AppState) -> AppState {
    for _ in 0..100 {
        let current = orchestrator.app_state(app_id);
        if current == state {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    orchestrator.app_state(app_id)
}

#[tokio::test]
async fn run_reaches_running_and_stop_returns_to_idle() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();

    let result = orchestrator
        .run_app(RunRequest::new(1, app.path(), "web"))
        .await
        .unwrap();
    assert!(result.ready);
    assert!(result.process_id.is_some());
    assert!(result.job_id.is_some());
    assert_eq!(orchestrator.app_state(1), AppState::Running);
    assert!(orchestrator.is_ready(1));

    orchestrator.stop_app(1).await.unwrap();
    assert_eq!(orchestrator.app_state(1), AppState::Idle);
    assert!(!orchestrator.is_ready(1));
    assert_eq!(runtimes.node.calls(), ["check", "run"]);

    // Stopping again is a no-op.
    assert_eq!(orchestrator.stop_app(1).await.unwrap(), None);
}

#[tokio::test]
async fn missing_readiness_signal_errors_the_app_and_errors_are_not_sticky() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.node.edit_script(|s| {
        s.frontend = Some("echo 'compiling...'; exec sleep 30".into());
        s.readiness_timeout = Duration::from_millis(300);
    });

    let result = orchestrator
        .run_app(RunRequest::new(2, app.path(), "web"))
        .await
        .unwrap();
    assert!(!result.ready);
    assert!(result.error.unwrap().contains("no readiness signal"));
    assert_eq!(orchestrator.app_state(2), AppState::Errored);
    let snapshot = orchestrator.app_snapshot(2).unwrap();
    assert!(snapshot.last_error.is_some());

    runtimes.node.edit_script(|s| {
        s.frontend = Some(format!("echo '{READY_LINE}'; exec sleep 30"));
    });
    let result = orchestrator
        .run_app(RunRequest::new(2, app.path(), "web"))
        .await
        .unwrap();
    assert!(result.ready);
    assert_eq!(orchestrator.app_state(2), AppState::Running);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn concurrent_operations_on_one_app_are_rejected_as_busy() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.node.edit_script(|s| s.build_delay = Duration::from_millis(500));

    let build = BuildRequest {
        app_id: 3,
        app_path: app.path().to_path_buf(),
        stack_type: "web".into(),
        configuration: BuildConfiguration::Debug,
    };
    let (built, ran, stopped) = tokio::join!(
        orchestrator.build_app(&build),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.run_app(RunRequest::new(3, app.path(), "web")).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            orchestrator.stop_app(3).await
        },
    );

    assert!(built.unwrap().success);
    assert!(matches!(ran, Err(RuntimeError::Busy(3))));
    assert!(matches!(stopped, Err(RuntimeError::Busy(3))));
    assert_eq!(orchestrator.app_state(3), AppState::Idle);
    assert!(!runtimes.node.calls().contains(&"run".to_owned()));
}

#[tokio::test]
async fn second_run_while_starting_does_not_disturb_the_first() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.node.edit_script(|s| {
        s.frontend = Some(format!("sleep 0.5; echo '{READY_LINE}'; exec sleep 30"));
    });

    let (first, second) = tokio::join!(
        orchestrator.run_app(RunRequest::new(4, app.path(), "web")),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.run_app(RunRequest::new(4, app.path(), "web")).await
        },
    );
    assert!(first.unwrap().ready);
    assert!(matches!(second, Err(RuntimeError::Busy(4))));
    assert_eq!(orchestrator.app_state(4), AppState::Running);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn stop_while_starting_cancels_the_run() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.node.edit_script(|s| {
        s.frontend = Some("exec sleep 30".into());
        s.readiness_timeout = Duration::from_secs(20);
    });

    let started = std::time::Instant::now();
    let (ran, stopped) = tokio::join!(
        orchestrator.run_app(RunRequest::new(5, app.path(), "web")),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            orchestrator.stop_app(5).await
        },
    );

    assert_eq!(stopped.unwrap(), None);
    let ran = ran.unwrap();
    assert!(!ran.ready);
    assert!(ran.error.is_some());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(orchestrator.app_state(5), AppState::Idle);
}

#[tokio::test]
async fn unexpected_exit_moves_a_running_app_to_errored() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.node.edit_script(|s| {
        s.frontend = Some(format!("echo '{READY_LINE}'; sleep 0.3; echo 'boom' >&2; exit 3"));
    });

    let result = orchestrator
        .run_app(RunRequest::new(6, app.path(), "web"))
        .await
        .unwrap();
    assert!(result.ready);

    assert_eq!(wait_for_state(&orchestrator, 6, AppState::Errored).await, AppState::Errored);
    let snapshot = orchestrator.app_snapshot(6).unwrap();
    assert_eq!(snapshot.last_exit_code, Some(3));
    assert!(snapshot.last_error.unwrap().contains("boom"));
    assert!(snapshot.process_ids.is_empty());
}

#[tokio::test]
async fn clean_exit_without_a_stop_request_is_an_error() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.node.edit_script(|s| {
        s.frontend = Some(format!("echo '{READY_LINE}'; sleep 0.2"));
    });

    assert!(
        orchestrator
            .run_app(RunRequest::new(7, app.path(), "web"))
            .await
            .unwrap()
            .ready
    );
    assert_eq!(wait_for_state(&orchestrator, 7, AppState::Errored).await, AppState::Errored);
    let snapshot = orchestrator.app_snapshot(7).unwrap();
    assert_eq!(snapshot.last_exit_code, Some(0));
    assert!(snapshot.last_error.unwrap().contains("exited unexpectedly (code 0)"));
    assert!(!orchestrator.is_ready(7));
}

#[tokio::test]
async fn missing_toolchain_short_circuits_run_and_build() {
    let (orchestrator, runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();
    runtimes.dotnet.edit_script(|s| {
        s.prerequisites.ready = false;
        s.prerequisites.missing = vec![".NET SDK".into()];
    });

    let err = orchestrator
        .run_app(RunRequest::new(8, app.path(), "wpf"))
        .await
        .unwrap_err();
    match err {
        RuntimeError::PrerequisiteMissing { missing } => assert_eq!(missing, [".NET SDK"]),
        other => panic!("expected PrerequisiteMissing, got {other:?}"),
    }
    let build = BuildRequest {
        app_id: 8,
        app_path: app.path().to_path_buf(),
        stack_type: "desktop".into(),
        configuration: BuildConfiguration::Release,
    };
    assert!(matches!(
        orchestrator.build_app(&build).await,
        Err(RuntimeError::PrerequisiteMissing { .. })
    ));

    // One probe serves both calls.
    assert_eq!(runtimes.dotnet.calls(), ["check"]);
    assert_eq!(orchestrator.app_state(8), AppState::Idle);
}

#[tokio::test]
async fn forget_stops_the_app_and_drops_its_logs() {
    let (orchestrator, _runtimes) = scripted_orchestrator(IDLE_WATCH);
    let app = TestApp::empty();

    assert!(
        orchestrator
            .run_app(RunRequest::new(9, app.path(), "web"))
            .await
            .unwrap()
            .ready
    );
    orchestrator.forget(9).await.unwrap();
    assert!(orchestrator.app_snapshot(9).is_none());
    assert!(
        orchestrator
            .get_logs(9, stackpilot_core::logs::LogRole::System)
            .is_empty()
    );
}
