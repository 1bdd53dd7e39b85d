//! Per-app run state machine.
//!
//! The controller owns every process a provider launches for an app and is
//! the only writer of that app's [`AppState`]:
//!
//! ```text
//! idle     -> starting
//! errored  -> starting   (errors are never sticky)
//! starting -> running    (readiness observed)
//! starting -> errored    (failed, timed out, or killed by the kernel)
//! starting -> idle       (stopped before ready)
//! running  -> stopping   (explicit stop)
//! running  -> errored    (primary process exited without a stop request)
//! stopping -> idle
//! stopping -> errored    (stop itself failed)
//! ```
//!
//! At most one build, run, stop or edit is in flight per app; a second one
//! is rejected with [`RuntimeError::Busy`]. The one exception is `stop`
//! during `starting`, which cancels the in-flight run instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AppId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{ExecOutcome, KillReason};
use crate::logs::{LogRouter, RunMode};
use crate::provider::{
    BuildRequest, BuildResult, PreviewHandle, PreviewOptions, RoleProcess, RunLaunch, RunRequest,
    RunResult, RuntimeProvider,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl AppState {
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        use AppState::*;
        matches!(
            (from, to),
            (Idle, Starting)
                | (Errored, Starting)
                | (Starting, Running)
                | (Starting, Errored)
                | (Starting, Idle)
                | (Running, Stopping)
                | (Running, Errored)
                | (Stopping, Idle)
                | (Stopping, Errored)
        )
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Errored => "errored",
        })
    }
}

/// The operation currently holding an app's busy slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Build,
    Run,
    Stop,
    Edit,
    Install,
    Package,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Run => "run",
            Self::Stop => "stop",
            Self::Edit => "edit",
            Self::Install => "install",
            Self::Package => "package",
        })
    }
}

/// Point-in-time view of one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppSnapshot {
    pub app_id: AppId,
    pub state: AppState,
    pub busy: Option<Operation>,
    pub stack_type: Option<String>,
    pub mode: Option<RunMode>,
    pub started_at: Option<DateTime<Utc>>,
    pub process_ids: Vec<u32>,
    pub url: Option<String>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub violation: Option<KillReason>,
    pub previewing: bool,
}

#[derive(Default)]
struct AppEntry {
    state: AppState,
    busy: Option<Operation>,
    /// Bumped on every run so a stale exit monitor can tell it is stale.
    generation: u64,
    run_cancel: Option<CancellationToken>,
    stop_requested: bool,
    provider: Option<Arc<dyn RuntimeProvider>>,
    processes: Vec<RoleProcess>,
    stack_type: Option<String>,
    mode: Option<RunMode>,
    started_at: Option<DateTime<Utc>>,
    url: Option<String>,
    last_exit_code: Option<i32>,
    last_error: Option<String>,
    violation: Option<KillReason>,
    preview: Option<PreviewHandle>,
}

impl AppEntry {
    fn transition(&mut self, app_id: AppId, to: AppState) {
        if !AppState::is_valid_transition(self.state, to) {
            warn!(app_id, from = %self.state, to = %to, "unexpected state transition");
        }
        debug!(app_id, from = %self.state, to = %to, "app state");
        self.state = to;
    }

    fn snapshot(&self, app_id: AppId) -> AppSnapshot {
        AppSnapshot {
            app_id,
            state: self.state,
            busy: self.busy,
            stack_type: self.stack_type.clone(),
            mode: self.mode,
            started_at: self.started_at,
            process_ids: self.processes.iter().filter_map(|p| p.handle.pid()).collect(),
            url: self.url.clone(),
            last_exit_code: self.last_exit_code,
            last_error: self.last_error.clone(),
            violation: self.violation,
            previewing: self.preview.is_some(),
        }
    }
}

type Apps = Arc<Mutex<HashMap<AppId, AppEntry>>>;

fn lock(apps: &Apps) -> MutexGuard<'_, HashMap<AppId, AppEntry>> {
    apps.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds an app's busy slot; releasing happens on drop so an abandoned
/// future cannot leave the app locked.
pub struct BusyGuard {
    apps: Apps,
    app_id: AppId,
    operation: Operation,
    generation: u64,
}

impl BusyGuard {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut apps = lock(&self.apps);
        let Some(entry) = apps.get_mut(&self.app_id) else {
            return;
        };
        if entry.busy == Some(self.operation) && entry.generation == self.generation {
            entry.busy = None;
        }
        // A run future dropped before it settled.
        if self.operation == Operation::Run
            && entry.state == AppState::Starting
            && entry.generation == self.generation
        {
            if let Some(cancel) = entry.run_cancel.take() {
                cancel.cancel();
            }
            entry.transition(self.app_id, AppState::Errored);
            entry.last_error = Some("run was abandoned before it became ready".into());
        }
    }
}

impl fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyGuard")
            .field("app_id", &self.app_id)
            .field("operation", &self.operation)
            .finish()
    }
}

pub struct LifecycleController {
    apps: Apps,
    router: Arc<LogRouter>,
}

impl LifecycleController {
    pub fn new(router: Arc<LogRouter>) -> Self {
        Self {
            apps: Arc::new(Mutex::new(HashMap::new())),
            router,
        }
    }

    /// Claim the busy slot for `operation`, or fail with `Busy`.
    pub fn acquire(&self, app_id: AppId, operation: Operation) -> RuntimeResult<BusyGuard> {
        let mut apps = lock(&self.apps);
        let entry = apps.entry(app_id).or_default();
        if let Some(current) = entry.busy {
            debug!(app_id, %current, requested = %operation, "app busy");
            return Err(RuntimeError::Busy(app_id));
        }
        if matches!(entry.state, AppState::Starting | AppState::Stopping) {
            return Err(RuntimeError::Busy(app_id));
        }
        entry.busy = Some(operation);
        Ok(BusyGuard {
            apps: self.apps.clone(),
            app_id,
            operation,
            generation: entry.generation,
        })
    }

    pub async fn build(
        &self,
        provider: Arc<dyn RuntimeProvider>,
        request: &BuildRequest,
    ) -> RuntimeResult<BuildResult> {
        let _guard = self.acquire(request.app_id, Operation::Build)?;
        let app_id = request.app_id;
        self.router.system(
            app_id,
            format!("build started ({} {})", request.stack_type, request.configuration),
        );
        let started = std::time::Instant::now();
        let result = provider
            .build(request, Some(self.router.system_tap(app_id)))
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(build) if build.success => {
                info!(app_id, elapsed_ms, warnings = build.warnings.len(), "build succeeded");
                self.router.system(app_id, "build succeeded");
            }
            Ok(build) => {
                warn!(app_id, elapsed_ms, errors = build.errors.len(), "build failed");
                self.router
                    .system(app_id, format!("build failed with {} error(s)", build.errors.len()));
                for error in &build.errors {
                    self.router.system(app_id, error);
                }
            }
            Err(e) => {
                warn!(app_id, elapsed_ms, error = %e, "build aborted");
                self.router.system(app_id, format!("build aborted: {e}"));
            }
        }
        result
    }

    /// Launch the app and wait for readiness.
    ///
    /// Provider failures do not surface as `Err`: the app moves to
    /// `Errored` and the result carries `ready = false` and the error.
    /// `Err` is reserved for calls rejected up front (`Busy`).
    pub async fn run(
        &self,
        provider: Arc<dyn RuntimeProvider>,
        mut request: RunRequest,
    ) -> RuntimeResult<RunResult> {
        let app_id = request.app_id;
        let mode = request.mode.unwrap_or_else(|| {
            if request.backend.is_some() {
                RunMode::Fullstack
            } else {
                provider.default_run_mode()
            }
        });
        request.mode = Some(mode);

        let (guard, cancel) = {
            let mut apps = lock(&self.apps);
            let entry = apps.entry(app_id).or_default();
            if entry.busy.is_some() || !matches!(entry.state, AppState::Idle | AppState::Errored) {
                return Err(RuntimeError::Busy(app_id));
            }
            entry.generation += 1;
            entry.busy = Some(Operation::Run);
            entry.transition(app_id, AppState::Starting);
            let cancel = CancellationToken::new();
            entry.run_cancel = Some(cancel.clone());
            entry.stop_requested = false;
            entry.provider = Some(provider.clone());
            entry.stack_type = Some(request.stack_type.clone());
            entry.mode = Some(mode);
            entry.started_at = None;
            entry.url = None;
            entry.last_exit_code = None;
            entry.last_error = None;
            entry.violation = None;
            let guard = BusyGuard {
                apps: self.apps.clone(),
                app_id,
                operation: Operation::Run,
                generation: entry.generation,
            };
            (guard, cancel)
        };

        info!(app_id, stack = %request.stack_type, ?mode, "starting app");
        self.router.system(app_id, format!("starting {} app", request.stack_type));
        let taps = self.router.taps(app_id, mode);
        let launched = provider.run(&request, taps, &cancel).await;

        let mut orphans = Vec::new();
        let outcome = {
            let mut apps = lock(&self.apps);
            match apps.get_mut(&app_id) {
                None => {
                    if let Ok(launch) = launched {
                        orphans = launch.processes;
                    }
                    Ok(RunResult::failed("app was forgotten while starting", None))
                }
                Some(entry) => self.settle_run(app_id, entry, launched, cancel.is_cancelled(), &mut orphans),
            }
        };
        drop(guard);

        for process in &orphans {
            process.handle.terminate();
        }
        match outcome {
            Ok(result) if result.ready => {
                let target = result.url.as_deref().unwrap_or("native window");
                self.router.system(app_id, format!("ready ({target})"));
                Ok(result)
            }
            Ok(result) => {
                self.router.system(app_id, "stopped before ready");
                Ok(result)
            }
            Err(e) => {
                warn!(app_id, error = %e, sandbox_violation = e.is_sandbox_violation(), "app failed to start");
                self.router.system(app_id, format!("failed to start: {e}"));
                Ok(RunResult::failed(e.to_string(), violation_of(&e)))
            }
        }
    }

    fn settle_run(
        &self,
        app_id: AppId,
        entry: &mut AppEntry,
        launched: RuntimeResult<RunLaunch>,
        cancelled: bool,
        orphans: &mut Vec<RoleProcess>,
    ) -> RuntimeResult<RunResult> {
        let stopped = entry.stop_requested || cancelled;
        match launched {
            Ok(launch) if !stopped => {
                entry.transition(app_id, AppState::Running);
                entry.processes = launch.processes;
                entry.started_at = Some(Utc::now());
                entry.url = launch.result.url.clone();
                entry.mode = Some(launch.mode);
                self.spawn_monitor(app_id, entry);
                Ok(launch.result)
            }
            Ok(launch) => {
                *orphans = launch.processes;
                entry.transition(app_id, AppState::Idle);
                Ok(RunResult::failed("stopped before the app became ready", None))
            }
            Err(_) if stopped => {
                entry.transition(app_id, AppState::Idle);
                Ok(RunResult::failed("stopped before the app became ready", None))
            }
            Err(e) => {
                entry.transition(app_id, AppState::Errored);
                entry.last_error = Some(e.to_string());
                entry.violation = violation_of(&e);
                Err(e)
            }
        }
    }

    /// Watch the primary process; an exit nobody asked for ends the run.
    fn spawn_monitor(&self, app_id: AppId, entry: &AppEntry) {
        let Some(primary) = crate::provider::types::primary_process(&entry.processes).cloned() else {
            return;
        };
        let siblings: Vec<RoleProcess> = entry
            .processes
            .iter()
            .filter(|p| p.handle.job_id() != primary.handle.job_id())
            .cloned()
            .collect();
        let generation = entry.generation;
        let apps = self.apps.clone();
        let router = self.router.clone();

        tokio::spawn(async move {
            let outcome = primary.handle.wait().await;
            let summary = {
                let mut apps = lock(&apps);
                let Some(entry) = apps.get_mut(&app_id) else {
                    return;
                };
                if entry.generation != generation || entry.state != AppState::Running || entry.stop_requested {
                    return;
                }
                entry.processes.clear();
                entry.started_at = None;
                match &outcome {
                    Ok(outcome) => {
                        let message = unexpected_exit_message(outcome);
                        entry.last_exit_code = outcome.exit_code;
                        entry.violation = outcome.killed_reason.filter(|r| *r != KillReason::Cancelled);
                        entry.last_error = Some(message.clone());
                        entry.transition(app_id, AppState::Errored);
                        message
                    }
                    Err(e) => {
                        let message = format!("lost track of {}: {e}", primary.handle.program());
                        entry.last_error = Some(message.clone());
                        entry.transition(app_id, AppState::Errored);
                        message
                    }
                }
            };
            warn!(app_id, detail = %summary, "app process ended without a stop request");
            router.system(app_id, summary);
            for sibling in &siblings {
                let _ = sibling.handle.terminate_and_wait().await;
            }
        });
    }

    /// Stop the app. Idempotent: stopping an idle app is a no-op.
    ///
    /// While `starting`, this cancels the in-flight run and returns at
    /// once; the run settles the app to `idle`.
    pub async fn stop(&self, app_id: AppId) -> RuntimeResult<Option<i32>> {
        let (guard, provider, processes, preview) = {
            let mut apps = lock(&self.apps);
            let Some(entry) = apps.get_mut(&app_id) else {
                return Ok(None);
            };
            match entry.state {
                AppState::Starting => {
                    entry.stop_requested = true;
                    if let Some(cancel) = &entry.run_cancel {
                        cancel.cancel();
                    }
                    info!(app_id, "stop requested while starting; cancelling run");
                    return Ok(None);
                }
                _ if entry.busy.is_some() => return Err(RuntimeError::Busy(app_id)),
                AppState::Stopping => return Err(RuntimeError::Busy(app_id)),
                AppState::Idle | AppState::Errored => return Ok(None),
                AppState::Running => {}
            }
            entry.busy = Some(Operation::Stop);
            entry.stop_requested = true;
            entry.transition(app_id, AppState::Stopping);
            let guard = BusyGuard {
                apps: self.apps.clone(),
                app_id,
                operation: Operation::Stop,
                generation: entry.generation,
            };
            (
                guard,
                entry.provider.clone(),
                std::mem::take(&mut entry.processes),
                entry.preview.take(),
            )
        };

        self.router.system(app_id, "stopping");
        let stopped = match &provider {
            Some(provider) => {
                if let Some(preview) = &preview {
                    if let Err(e) = provider.stop_preview(preview).await {
                        debug!(app_id, error = %e, "preview already gone");
                    }
                }
                provider.stop(app_id, &processes).await
            }
            None => crate::provider::stop_processes(&processes).await,
        };

        {
            let mut apps = lock(&self.apps);
            if let Some(entry) = apps.get_mut(&app_id) {
                entry.started_at = None;
                entry.url = None;
                match &stopped {
                    Ok(code) => {
                        entry.last_exit_code = *code;
                        entry.transition(app_id, AppState::Idle);
                    }
                    Err(e) => {
                        entry.last_error = Some(e.to_string());
                        entry.transition(app_id, AppState::Errored);
                    }
                }
            }
        }
        drop(guard);

        match &stopped {
            Ok(code) => {
                info!(app_id, exit_code = ?code, "app stopped");
                self.router.system(app_id, "stopped");
            }
            Err(e) => {
                warn!(app_id, error = %e, "stop failed");
                self.router.system(app_id, format!("stop failed: {e}"));
            }
        }
        stopped
    }

    pub fn state(&self, app_id: AppId) -> AppState {
        lock(&self.apps)
            .get(&app_id)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// True once a readiness signal was seen and the app has not exited.
    pub fn is_ready(&self, app_id: AppId) -> bool {
        self.state(app_id) == AppState::Running
    }

    pub fn snapshot(&self, app_id: AppId) -> Option<AppSnapshot> {
        lock(&self.apps).get(&app_id).map(|e| e.snapshot(app_id))
    }

    pub fn snapshots(&self) -> Vec<AppSnapshot> {
        let mut all: Vec<AppSnapshot> = lock(&self.apps)
            .iter()
            .map(|(id, e)| e.snapshot(*id))
            .collect();
        all.sort_by_key(|s| s.app_id);
        all
    }

    /// Open a preview, replacing any previous one for the app. The run's
    /// URL is filled in when the caller has none.
    pub async fn start_preview(
        &self,
        provider: Arc<dyn RuntimeProvider>,
        mut options: PreviewOptions,
    ) -> RuntimeResult<PreviewHandle> {
        let app_id = options.app_id;
        let previous = {
            let mut apps = lock(&self.apps);
            let entry = apps.entry(app_id).or_default();
            if options.url.is_none() {
                options.url = entry.url.clone();
            }
            entry.preview.take()
        };
        if let Some(previous) = previous {
            provider.stop_preview(&previous).await?;
        }

        let handle = provider.start_preview(&options).await?;
        {
            let mut apps = lock(&self.apps);
            let entry = apps.entry(app_id).or_default();
            entry.preview = Some(handle.clone());
            if entry.provider.is_none() {
                entry.provider = Some(provider);
            }
        }
        self.router
            .system(app_id, format!("preview opened ({})", handle.strategy));
        Ok(handle)
    }

    pub async fn stop_preview(&self, app_id: AppId) -> RuntimeResult<()> {
        let (preview, provider) = {
            let mut apps = lock(&self.apps);
            match apps.get_mut(&app_id) {
                Some(entry) => (entry.preview.take(), entry.provider.clone()),
                None => return Ok(()),
            }
        };
        match (preview, provider) {
            (Some(preview), Some(provider)) => provider.stop_preview(&preview).await,
            (Some(preview), None) => {
                if let Some(process) = &preview.process {
                    process.terminate_and_wait().await?;
                }
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    /// Stop the app, then drop its entry and logs.
    pub async fn forget(&self, app_id: AppId) -> RuntimeResult<()> {
        self.stop(app_id).await?;
        self.stop_preview(app_id).await?;
        lock(&self.apps).remove(&app_id);
        self.router.clear(app_id);
        Ok(())
    }

    /// Stop every app. Errors are logged, not returned.
    pub async fn shutdown(&self) {
        let ids: Vec<AppId> = lock(&self.apps).keys().copied().collect();
        for app_id in ids {
            if let Err(e) = self.stop(app_id).await {
                warn!(app_id, error = %e, "stop during shutdown failed");
            }
            if let Err(e) = self.stop_preview(app_id).await {
                warn!(app_id, error = %e, "preview stop during shutdown failed");
            }
        }
    }
}

fn violation_of(error: &RuntimeError) -> Option<KillReason> {
    match error {
        RuntimeError::SandboxViolation { reason, .. } => Some(*reason),
        _ => None,
    }
}

/// Any exit without a stop request is unexpected, including code 0.
fn unexpected_exit_message(outcome: &ExecOutcome) -> String {
    if let Some(violation) = outcome.violation() {
        return violation.to_string();
    }
    if outcome.success() {
        return format!("{} exited unexpectedly (code 0)", outcome.program);
    }
    let code = outcome
        .exit_code
        .map_or_else(|| "a signal".to_owned(), |c| format!("code {c}"));
    match outcome.last_error_line() {
        Some(line) => format!("{} exited with {code}: {line}", outcome.program),
        None => format!("{} exited with {code}", outcome.program),
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("apps", &lock(&self.apps).len())
            .finish_non_exhaustive()
    }
}
