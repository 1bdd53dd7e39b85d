//! Hot-reload sessions for .NET stacks.
//!
//! A session wraps one long-running file watcher (`dotnet watch` by
//! default) started through the execution kernel. The watcher's output
//! goes to the app's system sink and is scanned for reload, ready and
//! build-error lines that update the session. Consumers poll
//! [`HotReloadManager::status`]; the manager is the only writer.
//!
//! ```text
//! starting -> active     (watcher spawned)
//! starting -> failed     (pre-build or spawn failed)
//! active   -> stopping   (explicit stop)
//! stopping -> stopped
//! active   -> stopped    (watcher exited with code 0)
//! active   -> failed     (watcher exited otherwise)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppId;
use crate::config::HotReloadSection;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{
    ExecOutcome, ExecRequest, ExecutionKernel, NetworkPolicy, OutputCallback, OutputLine,
    ProcessHandle, RiskProfile,
};
use crate::logs::LogRouter;
use crate::provider::BuildConfiguration;
use crate::provider::dotnet::diagnostics::BuildDiagnostics;

/// Stack types whose runtime can apply edits in place.
pub const SUPPORTED_STACKS: &[&str] = &["wpf", "winui3", "winforms", "console", "maui"];

static RELOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)hot reload|applying changes|updating|reloading|file changed|detected file change")
        .expect("valid regex")
});
static READY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)application started|build succeeded|running|now listening|ready")
        .expect("valid regex")
});
static BUILD_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error CS\d+|error MSB\d+|build FAILED|compilation failed").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// Starting or active: a second session may not be opened.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotReloadSession {
    pub app_id: AppId,
    pub app_path: PathBuf,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_reload_at: Option<DateTime<Utc>>,
    pub reload_count: u32,
    /// Last build error or failure reason.
    pub error: Option<String>,
    pub process_id: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotReloadOptions {
    pub app_id: AppId,
    pub app_path: PathBuf,
    #[serde(default)]
    pub configuration: BuildConfiguration,
    pub framework: Option<String>,
    #[serde(default)]
    pub no_restore: bool,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportCheck {
    pub supported: bool,
    pub message: Option<String>,
}

/// Static capability lookup; starts nothing.
pub fn check_support(stack_type: &str) -> SupportCheck {
    let stack = stack_type.to_ascii_lowercase();
    if SUPPORTED_STACKS.contains(&stack.as_str()) {
        SupportCheck {
            supported: true,
            message: None,
        }
    } else {
        SupportCheck {
            supported: false,
            message: Some(format!(
                "hot reload is not available for {stack_type:?}; supported stacks: {}",
                SUPPORTED_STACKS.join(", ")
            )),
        }
    }
}

/// The watcher process a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub dotnet_flags: bool,
    pub prebuild: bool,
}

impl Default for WatchCommand {
    fn default() -> Self {
        Self::from(&HotReloadSection::default())
    }
}

impl From<&HotReloadSection> for WatchCommand {
    fn from(section: &HotReloadSection) -> Self {
        Self {
            program: section.watch_program.clone(),
            args: section.watch_args.clone(),
            dotnet_flags: section.dotnet_flags,
            prebuild: section.prebuild,
        }
    }
}

impl WatchCommand {
    fn watch_args(&self, options: &HotReloadOptions) -> Vec<String> {
        let mut args = self.args.clone();
        if self.dotnet_flags {
            args.extend(["--configuration".into(), options.configuration.to_string()]);
            if let Some(framework) = &options.framework {
                args.extend(["--framework".into(), framework.clone()]);
            }
            if options.no_restore {
                args.push("--no-restore".into());
            }
            args.extend(["--verbosity".into(), "normal".into()]);
        }
        args
    }

    fn prebuild_args(options: &HotReloadOptions) -> Vec<String> {
        vec![
            "build".into(),
            "--configuration".into(),
            options.configuration.to_string(),
            "--verbosity".into(),
            "quiet".into(),
        ]
    }
}

struct SessionEntry {
    id: Uuid,
    session: HotReloadSession,
    cancel: CancellationToken,
    handle: Option<ProcessHandle>,
    stop_requested: bool,
}

impl SessionEntry {
    fn set_status(&mut self, status: SessionStatus) {
        debug!(
            app_id = self.session.app_id,
            from = %self.session.status,
            to = %status,
            "hot reload session transition"
        );
        self.session.status = status;
    }

    /// Fold one watcher line into the session.
    fn observe(&mut self, text: &str) {
        if RELOAD_RE.is_match(text) {
            self.session.reload_count += 1;
            self.session.last_reload_at = Some(Utc::now());
        }
        if BUILD_ERROR_RE.is_match(text) {
            self.session.error = Some(text.trim().to_owned());
        } else if READY_RE.is_match(text) {
            self.session.error = None;
        }
    }
}

type Sessions = Arc<Mutex<HashMap<AppId, SessionEntry>>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<AppId, SessionEntry>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every hot-reload session, at most one live session per app.
pub struct HotReloadManager {
    kernel: Arc<ExecutionKernel>,
    router: Arc<LogRouter>,
    command: WatchCommand,
    build_timeout: Duration,
    sessions: Sessions,
}

impl HotReloadManager {
    pub fn new(
        kernel: Arc<ExecutionKernel>,
        router: Arc<LogRouter>,
        command: WatchCommand,
        build_timeout: Duration,
    ) -> Self {
        Self {
            kernel,
            router,
            command,
            build_timeout,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn check_support(&self, stack_type: &str) -> SupportCheck {
        check_support(stack_type)
    }

    /// Open a session for `options.app_id`.
    ///
    /// Fails with [`RuntimeError::SessionActive`] if a session for the app
    /// is already starting or active; the existing session is untouched.
    pub async fn start(&self, options: HotReloadOptions) -> RuntimeResult<HotReloadSession> {
        let app_id = options.app_id;
        let (id, cancel) = {
            let mut sessions = lock(&self.sessions);
            if sessions.get(&app_id).is_some_and(|e| e.session.status.is_live()) {
                warn!(app_id, "hot reload session already active");
                return Err(RuntimeError::SessionActive(app_id));
            }
            let entry = SessionEntry {
                id: Uuid::new_v4(),
                session: HotReloadSession {
                    app_id,
                    app_path: options.app_path.clone(),
                    status: SessionStatus::Starting,
                    started_at: Utc::now(),
                    last_reload_at: None,
                    reload_count: 0,
                    error: None,
                    process_id: None,
                },
                cancel: CancellationToken::new(),
                handle: None,
                stop_requested: false,
            };
            let ids = (entry.id, entry.cancel.clone());
            sessions.insert(app_id, entry);
            ids
        };

        self.router.system(app_id, "starting hot reload session");
        match self.launch(&options, id, &cancel).await {
            Ok(handle) => Ok(self.activate(app_id, id, handle)),
            Err(e) => {
                warn!(app_id, error = %e, "hot reload failed to start");
                self.router
                    .system(app_id, format!("failed to start hot reload: {e}"));
                if let Some(entry) = lock(&self.sessions).get_mut(&app_id).filter(|e| e.id == id) {
                    entry.session.error = Some(e.to_string());
                    entry.set_status(if entry.stop_requested {
                        SessionStatus::Stopped
                    } else {
                        SessionStatus::Failed
                    });
                }
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        options: &HotReloadOptions,
        session_id: Uuid,
        cancel: &CancellationToken,
    ) -> RuntimeResult<ProcessHandle> {
        let app_id = options.app_id;
        if self.command.prebuild {
            let request = ExecRequest::new(&self.command.program, &options.app_path)
                .for_app(app_id)
                .args(WatchCommand::prebuild_args(options))
                .network(NetworkPolicy::None)
                .risk(RiskProfile::Medium)
                .timeout(self.build_timeout);
            let outcome = self
                .kernel
                .execute(request, Some(self.router.system_tap(app_id)), cancel)
                .await?;
            if cancel.is_cancelled() {
                return Err(RuntimeError::RuntimeStart(
                    "hot reload was stopped before the watcher started".into(),
                ));
            }
            check_prebuild(&outcome)?;
        }

        let mut request = ExecRequest::new(&self.command.program, &options.app_path)
            .for_app(app_id)
            .args(self.command.watch_args(options))
            .env("DOTNET_ENVIRONMENT", "Development")
            .env("DOTNET_WATCH_SUPPRESS_LAUNCH_BROWSER", "1")
            .network(NetworkPolicy::Restricted)
            .risk(RiskProfile::Medium)
            .long_running();
        for (key, value) in &options.env {
            request = request.env(key, value);
        }
        info!(app_id, command = %request.display_command(), "starting watcher");
        let handle = self
            .kernel
            .spawn(request, Some(self.watch_tap(app_id, session_id)), cancel)
            .await?;
        Ok(handle)
    }

    /// Output callback: system sink plus session bookkeeping.
    fn watch_tap(&self, app_id: AppId, session_id: Uuid) -> OutputCallback {
        let system = self.router.system_tap(app_id);
        let sessions = self.sessions.clone();
        Arc::new(move |line: OutputLine| {
            if let Some(entry) = lock(&sessions).get_mut(&app_id).filter(|e| e.id == session_id) {
                entry.observe(&line.text);
            }
            system(line);
        })
    }

    fn activate(&self, app_id: AppId, session_id: Uuid, handle: ProcessHandle) -> HotReloadSession {
        let session = {
            let mut sessions = lock(&self.sessions);
            match sessions.get_mut(&app_id).filter(|e| e.id == session_id) {
                Some(entry) => {
                    entry.session.process_id = handle.pid();
                    entry.handle = Some(handle.clone());
                    if !entry.stop_requested {
                        entry.set_status(SessionStatus::Active);
                    }
                    entry.session.clone()
                }
                None => {
                    // Forgotten while starting.
                    handle.terminate();
                    return HotReloadSession {
                        app_id,
                        app_path: PathBuf::new(),
                        status: SessionStatus::Stopped,
                        started_at: Utc::now(),
                        last_reload_at: None,
                        reload_count: 0,
                        error: None,
                        process_id: None,
                    };
                }
            }
        };
        info!(app_id, pid = ?session.process_id, "hot reload session active");
        self.router.system(app_id, "hot reload session started");
        self.spawn_monitor(app_id, session_id, handle);
        session
    }

    fn spawn_monitor(&self, app_id: AppId, session_id: Uuid, handle: ProcessHandle) {
        let sessions = self.sessions.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            let mut sessions = lock(&sessions);
            let Some(entry) = sessions.get_mut(&app_id).filter(|e| e.id == session_id) else {
                return;
            };
            entry.handle = None;
            entry.session.process_id = None;
            if entry.stop_requested {
                entry.set_status(SessionStatus::Stopped);
                return;
            }
            match outcome {
                Ok(outcome) if outcome.exit_code == Some(0) && outcome.killed_reason.is_none() => {
                    info!(app_id, "watcher exited cleanly");
                    entry.set_status(SessionStatus::Stopped);
                    router.system(app_id, "hot reload session ended");
                }
                Ok(outcome) => {
                    let message = match outcome.violation() {
                        Some(violation) => violation.to_string(),
                        None => format!(
                            "watcher exited with {}",
                            outcome
                                .exit_code
                                .map_or_else(|| "a signal".to_owned(), |c| format!("code {c}"))
                        ),
                    };
                    warn!(app_id, error = %message, "watcher exited unexpectedly");
                    router.system(app_id, format!("hot reload failed: {message}"));
                    entry.session.error = Some(message);
                    entry.set_status(SessionStatus::Failed);
                }
                Err(e) => {
                    warn!(app_id, error = %e, "lost watcher");
                    entry.session.error = Some(e.to_string());
                    entry.set_status(SessionStatus::Failed);
                }
            }
        });
    }

    /// `active -> stopping -> stopped`. Stopping an app with no live
    /// session is a no-op.
    pub async fn stop(&self, app_id: AppId) -> RuntimeResult<()> {
        let (id, cancel, handle) = {
            let mut sessions = lock(&self.sessions);
            let Some(entry) = sessions.get_mut(&app_id) else {
                debug!(app_id, "no hot reload session to stop");
                return Ok(());
            };
            if !entry.session.status.is_live() {
                return Ok(());
            }
            entry.stop_requested = true;
            if entry.session.status == SessionStatus::Active {
                entry.set_status(SessionStatus::Stopping);
            }
            (entry.id, entry.cancel.clone(), entry.handle.clone())
        };

        info!(app_id, "stopping hot reload session");
        cancel.cancel();
        let result = match handle {
            Some(handle) => handle.wait().await.map(|_| ()).map_err(RuntimeError::from),
            None => Ok(()),
        };

        if let Some(entry) = lock(&self.sessions).get_mut(&app_id).filter(|e| e.id == id) {
            entry.handle = None;
            entry.session.process_id = None;
            match &result {
                Ok(()) => entry.set_status(SessionStatus::Stopped),
                Err(e) => {
                    entry.session.error = Some(e.to_string());
                    entry.set_status(SessionStatus::Failed);
                }
            }
        }
        self.router.system(app_id, "hot reload session stopped");
        result
    }

    pub fn status(&self, app_id: AppId) -> Option<HotReloadSession> {
        lock(&self.sessions).get(&app_id).map(|e| e.session.clone())
    }

    pub fn is_active(&self, app_id: AppId) -> bool {
        lock(&self.sessions)
            .get(&app_id)
            .is_some_and(|e| e.session.status == SessionStatus::Active)
    }

    pub fn sessions(&self) -> Vec<HotReloadSession> {
        let mut all: Vec<_> = lock(&self.sessions)
            .values()
            .map(|e| e.session.clone())
            .collect();
        all.sort_by_key(|s| s.app_id);
        all
    }

    /// Stop and drop the app's session.
    pub async fn forget(&self, app_id: AppId) -> RuntimeResult<()> {
        let result = self.stop(app_id).await;
        lock(&self.sessions).remove(&app_id);
        result
    }

    /// Stop every session. Errors are logged, not returned.
    pub async fn shutdown(&self) {
        let ids: Vec<AppId> = lock(&self.sessions).keys().copied().collect();
        info!(sessions = ids.len(), "shutting down hot reload sessions");
        for app_id in ids {
            if let Err(e) = self.stop(app_id).await {
                warn!(app_id, error = %e, "hot reload stop during shutdown failed");
            }
        }
    }
}

fn check_prebuild(outcome: &ExecOutcome) -> RuntimeResult<()> {
    if let Some(violation) = outcome.violation() {
        return Err(violation);
    }
    if outcome.success() {
        return Ok(());
    }
    let mut errors = BuildDiagnostics::parse(outcome.all_lines()).error_strings();
    if errors.is_empty() {
        errors.push(
            outcome
                .last_error_line()
                .map_or_else(|| format!("{} build failed", outcome.program), str::to_owned),
        );
    }
    Err(RuntimeError::Build { errors })
}

impl std::fmt::Debug for HotReloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadManager")
            .field("command", &self.command)
            .field("sessions", &lock(&self.sessions).len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(app_id: AppId) -> HotReloadOptions {
        HotReloadOptions {
            app_id,
            app_path: PathBuf::from("/tmp/app"),
            ..Default::default()
        }
    }

    fn entry() -> SessionEntry {
        SessionEntry {
            id: Uuid::new_v4(),
            session: HotReloadSession {
                app_id: 1,
                app_path: PathBuf::new(),
                status: SessionStatus::Active,
                started_at: Utc::now(),
                last_reload_at: None,
                reload_count: 0,
                error: None,
                process_id: None,
            },
            cancel: CancellationToken::new(),
            handle: None,
            stop_requested: false,
        }
    }

    #[test]
    fn desktop_and_console_stacks_are_supported() {
        assert!(check_support("WPF").supported);
        assert!(check_support("console").supported);
        let react = check_support("react");
        assert!(!react.supported);
        assert!(react.message.unwrap().contains("wpf"));
    }

    #[test]
    fn dotnet_flags_follow_options() {
        let command = WatchCommand::default();
        let mut opts = options(1);
        opts.configuration = BuildConfiguration::Release;
        opts.framework = Some("net8.0-windows".into());
        opts.no_restore = true;
        assert_eq!(
            command.watch_args(&opts),
            [
                "watch",
                "--configuration",
                "Release",
                "--framework",
                "net8.0-windows",
                "--no-restore",
                "--verbosity",
                "normal"
            ]
        );
    }

    #[test]
    fn custom_commands_keep_their_arguments() {
        let command = WatchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 5".into()],
            dotnet_flags: false,
            prebuild: false,
        };
        assert_eq!(command.watch_args(&options(1)), ["-c", "sleep 5"]);
    }

    #[test]
    fn reload_lines_bump_the_counter() {
        let mut entry = entry();
        entry.observe("dotnet watch 🔥 Hot reload of changes succeeded.");
        entry.observe("dotnet watch ⌚ File changed: ./MainWindow.xaml");
        assert_eq!(entry.session.reload_count, 2);
        assert!(entry.session.last_reload_at.is_some());
    }

    #[test]
    fn build_errors_are_recorded_until_the_next_success() {
        let mut entry = entry();
        entry.observe("MainWindow.xaml.cs(12,5): error CS1002: ; expected");
        assert!(entry.session.error.as_deref().unwrap().contains("CS1002"));
        assert_eq!(entry.session.status, SessionStatus::Active);
        entry.observe("Build succeeded.");
        assert!(entry.session.error.is_none());
    }

    #[test]
    fn live_statuses_block_a_second_session() {
        assert!(SessionStatus::Starting.is_live());
        assert!(SessionStatus::Active.is_live());
        assert!(!SessionStatus::Stopped.is_live());
        assert!(!SessionStatus::Failed.is_live());
    }
}
