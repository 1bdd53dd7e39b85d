//! Sandboxed process execution.
//!
//! [`ExecutionKernel`] is the only place in the crate that spawns child
//! processes. Every spawn is checked against a program allow-list and a
//! [`NetworkPolicy`], placed in its own process group, and supervised by a
//! background task that enforces a wall-clock timeout and a resident
//! memory ceiling and honours cancellation.
//!
//! Output is split into lines and delivered to the caller's
//! [`OutputCallback`] as it arrives; a bounded tail of each stream is also
//! kept in the final [`ExecOutcome`].

mod limits;
pub mod line_buffer;
pub mod network;
mod output;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppId;
use crate::error::RuntimeError;

pub use line_buffer::LineBuffer;
pub use network::NetworkPolicy;
pub use output::{OutputCallback, OutputLine, OutputStream};
use output::OutputTail;

const MAX_LINE_BYTES: usize = 64 * 1024;
const TAIL_MAX_LINES: usize = 2_000;
const TAIL_MAX_BYTES: usize = 1024 * 1024;
/// How long to wait for pipes to close after the leader has exited.
const READER_DRAIN: Duration = Duration::from_secs(2);

// -----------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KernelError {
    /// The program or working directory failed a policy check.
    #[error("execution denied: {0}")]
    Denied(String),

    #[error("network policy {policy} denies host {host:?}")]
    NetworkDenied { host: String, policy: NetworkPolicy },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The supervisor task ended without publishing an outcome.
    #[error("supervisor for job {0} was lost")]
    Lost(Uuid),
}

impl KernelError {
    /// Whether the program itself could not be found on `PATH`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

// -----------------------------------------------------------------------
// Requests and outcomes
// -----------------------------------------------------------------------

/// How dangerous a command is to the host, as classified by the provider
/// that issues it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Why the kernel terminated a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Timeout,
    MemoryLimit,
    /// Caller-initiated stop.
    Cancelled,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::MemoryLimit => f.write_str("memory limit"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A single command to execute.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub app_id: Option<AppId>,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Falls back to [`KernelConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Sessions (dev servers, watchers, launched apps) have no wall-clock
    /// deadline; they end on cancellation or a memory kill.
    pub long_running: bool,
    /// Falls back to [`KernelConfig::default_memory_limit_mb`]; `Some(0)`
    /// disables the ceiling.
    pub memory_limit_mb: Option<u64>,
    pub network: NetworkPolicy,
    pub risk: RiskProfile,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            app_id: None,
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: None,
            long_running: false,
            memory_limit_mb: None,
            network: NetworkPolicy::default(),
            risk: RiskProfile::default(),
        }
    }

    pub fn for_app(mut self, app_id: AppId) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    pub fn memory_limit_mb(mut self, limit: u64) -> Self {
        self.memory_limit_mb = Some(limit);
        self
    }

    pub fn network(mut self, policy: NetworkPolicy) -> Self {
        self.network = policy;
        self
    }

    pub fn risk(mut self, risk: RiskProfile) -> Self {
        self.risk = risk;
        self
    }

    /// `program arg1 arg2`, for logs and error messages.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished (or killed) process.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub job_id: Uuid,
    pub program: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub killed_reason: Option<KillReason>,
    pub duration: Duration,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.killed_reason.is_none() && self.exit_code == Some(0)
    }

    /// A timeout or memory kill, as the error callers should surface.
    /// Cancellation is not a violation.
    pub fn violation(&self) -> Option<RuntimeError> {
        let reason = self.killed_reason?;
        let detail = match reason {
            KillReason::Cancelled => return None,
            KillReason::Timeout => format!(
                "{} exceeded its time budget and was killed after {:.1}s",
                self.program,
                self.duration.as_secs_f64()
            ),
            KillReason::MemoryLimit => format!(
                "{} exceeded its memory ceiling and was killed",
                self.program
            ),
        };
        Some(RuntimeError::SandboxViolation { reason, detail })
    }

    /// Both tails, stdout first.
    pub fn all_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout_tail
            .iter()
            .chain(self.stderr_tail.iter())
            .map(String::as_str)
    }

    /// Last non-empty stderr line, falling back to stdout.
    pub fn last_error_line(&self) -> Option<&str> {
        self.stderr_tail
            .iter()
            .rev()
            .chain(self.stdout_tail.iter().rev())
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    }
}

// -----------------------------------------------------------------------
// Process handle
// -----------------------------------------------------------------------

/// Handle to a supervised process tree.
///
/// Cloning is cheap; every clone refers to the same process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    job_id: Uuid,
    app_id: Option<AppId>,
    pid: Option<u32>,
    program: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<ExecOutcome>>,
}

impl ProcessHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn app_id(&self) -> Option<AppId> {
        self.app_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Request termination of the whole tree. Idempotent, and harmless if
    /// the process has already exited.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }

    pub fn try_outcome(&self) -> Option<ExecOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the supervisor to publish the outcome.
    pub async fn wait(&self) -> Result<ExecOutcome, KernelError> {
        let mut rx = self.outcome.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| KernelError::Lost(self.job_id))?
            .clone();
        outcome.ok_or(KernelError::Lost(self.job_id))
    }

    pub async fn terminate_and_wait(&self) -> Result<ExecOutcome, KernelError> {
        self.terminate();
        self.wait().await
    }
}

// -----------------------------------------------------------------------
// Kernel
// -----------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub default_timeout: Duration,
    pub default_memory_limit_mb: u64,
    pub memory_sample_interval: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Bare program names that may be spawned.
    pub allowed_programs: HashSet<String>,
    pub allowed_hosts: Vec<String>,
}

type ActiveJobs = Arc<Mutex<HashMap<Uuid, ProcessHandle>>>;

/// The single choke point for child process execution.
#[derive(Debug)]
pub struct ExecutionKernel {
    config: KernelConfig,
    active: ActiveJobs,
}

impl ExecutionKernel {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Spawn and wait for completion.
    pub async fn execute(
        &self,
        request: ExecRequest,
        output: Option<OutputCallback>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, KernelError> {
        self.spawn(request, output, cancel).await?.wait().await
    }

    /// Spawn a supervised process and return immediately.
    ///
    /// The returned handle's cancellation token is a child of `cancel`, so
    /// cancelling the caller's token also tears down this process.
    pub async fn spawn(
        &self,
        request: ExecRequest,
        output: Option<OutputCallback>,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle, KernelError> {
        self.check_program(&request.program)?;
        let cwd = canonical_dir(&request.cwd).await?;
        let policy_env = network::enforce(request.network, &request.args, &self.config.allowed_hosts)?;

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .current_dir(&cwd)
            .envs(request.env.iter().map(|(k, v)| (k, v)))
            .envs(policy_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| KernelError::Spawn {
            program: request.program.clone(),
            source,
        })?;

        let job_id = Uuid::new_v4();
        let pid = child.id();
        let timeout = (!request.long_running)
            .then(|| request.timeout.unwrap_or(self.config.default_timeout));
        let memory_limit_mb = request
            .memory_limit_mb
            .unwrap_or(self.config.default_memory_limit_mb);

        info!(
            job_id = %job_id,
            app_id = ?request.app_id,
            pid = ?pid,
            command = %request.display_command(),
            cwd = %cwd.display(),
            network = %request.network,
            risk = %request.risk,
            timeout_secs = ?timeout.map(|t| t.as_secs()),
            "spawned process"
        );

        let stdout_tail = Arc::new(Mutex::new(OutputTail::new(TAIL_MAX_LINES, TAIL_MAX_BYTES)));
        let stderr_tail = Arc::new(Mutex::new(OutputTail::new(TAIL_MAX_LINES, TAIL_MAX_BYTES)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                OutputStream::Stdout,
                output.clone(),
                stdout_tail.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                OutputStream::Stderr,
                output,
                stderr_tail.clone(),
            ));
        }

        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle {
            job_id,
            app_id: request.app_id,
            pid,
            program: request.program.clone(),
            started_at: Utc::now(),
            cancel: cancel.child_token(),
            outcome: rx,
        };
        lock(&self.active).insert(job_id, handle.clone());

        let supervision = Supervision {
            job_id,
            program: request.program,
            pid,
            timeout,
            memory_limit_bytes: (memory_limit_mb > 0).then(|| memory_limit_mb.saturating_mul(1024 * 1024)),
            sample_interval: self.config.memory_sample_interval,
            grace: self.config.kill_grace,
            cancel: handle.cancel.clone(),
            readers,
            stdout_tail,
            stderr_tail,
            started: Instant::now(),
        };
        let active = self.active.clone();
        tokio::spawn(async move {
            let outcome = supervise(child, supervision).await;
            lock(&active).remove(&outcome.job_id);
            tx.send_replace(Some(outcome));
        });

        Ok(handle)
    }

    /// Handles of every live process, optionally filtered by app.
    pub fn active_jobs(&self, app_id: Option<AppId>) -> Vec<ProcessHandle> {
        lock(&self.active)
            .values()
            .filter(|h| app_id.is_none() || h.app_id == app_id)
            .cloned()
            .collect()
    }

    /// Terminate every live process tree and wait for them to exit.
    pub async fn terminate_all(&self) {
        let handles = self.active_jobs(None);
        for handle in &handles {
            handle.terminate();
        }
        for handle in handles {
            if let Err(e) = handle.wait().await {
                warn!(
                    job_id = %handle.job_id(),
                    program = handle.program(),
                    error = %e,
                    "lost process during teardown"
                );
            }
        }
    }

    /// Only bare names resolved through `PATH` are accepted; a path would
    /// let any binary borrow an allowed name.
    fn check_program(&self, program: &str) -> Result<(), KernelError> {
        if program.contains(['/', '\\']) || Path::new(program).components().count() != 1 {
            return Err(KernelError::Denied(format!(
                "program {program:?} must be a bare name, not a path"
            )));
        }
        let name = program.strip_suffix(".exe").unwrap_or(program);
        if self.config.allowed_programs.contains(name) {
            Ok(())
        } else {
            Err(KernelError::Denied(format!(
                "program {program:?} is not on the allow-list"
            )))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn canonical_dir(path: &Path) -> Result<PathBuf, KernelError> {
    let canonical = tokio::fs::canonicalize(path).await.map_err(|e| {
        KernelError::Denied(format!(
            "working directory {} is not accessible: {e}",
            path.display()
        ))
    })?;
    if !canonical.is_dir() {
        return Err(KernelError::Denied(format!(
            "working directory {} is not a directory",
            path.display()
        )));
    }
    Ok(canonical)
}

fn spawn_reader<R>(
    stream: R,
    kind: OutputStream,
    output: Option<OutputCallback>,
    tail: Arc<Mutex<OutputTail>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = stream;
        let mut chunk = vec![0u8; 4096];
        let mut lines = LineBuffer::new(MAX_LINE_BYTES);
        let deliver = |text: String| {
            lock(&tail).push(text.clone());
            if let Some(callback) = &output {
                callback(OutputLine { stream: kind, text });
            }
        };

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => lines.push(&chunk[..n]).into_iter().for_each(&deliver),
                Err(e) => {
                    debug!(stream = %kind, error = %e, "output read failed");
                    break;
                }
            }
        }
        if let Some(rest) = lines.flush() {
            deliver(rest);
        }
        let overflowed = lines.consume_overflowed_bytes();
        if overflowed > 0 {
            debug!(stream = %kind, bytes = overflowed, "truncated over-long output lines");
        }
    })
}

// -----------------------------------------------------------------------
// Supervision
// -----------------------------------------------------------------------

struct Supervision {
    job_id: Uuid,
    program: String,
    pid: Option<u32>,
    timeout: Option<Duration>,
    memory_limit_bytes: Option<u64>,
    sample_interval: Duration,
    grace: Duration,
    cancel: CancellationToken,
    readers: Vec<JoinHandle<()>>,
    stdout_tail: Arc<Mutex<OutputTail>>,
    stderr_tail: Arc<Mutex<OutputTail>>,
    started: Instant,
}

enum Event {
    Exited(Option<ExitStatus>),
    Kill(KillReason),
    Sample,
}

async fn supervise(mut child: Child, mut ctx: Supervision) -> ExecOutcome {
    let timeout = ctx.timeout;
    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut sampler = tokio::time::interval(ctx.sample_interval);
    sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut status = None;
    let killed = loop {
        let event = tokio::select! {
            biased;
            result = child.wait() => Event::Exited(result.ok()),
            () = ctx.cancel.cancelled() => Event::Kill(KillReason::Cancelled),
            () = &mut deadline => Event::Kill(KillReason::Timeout),
            _ = sampler.tick(), if ctx.memory_limit_bytes.is_some() => Event::Sample,
        };
        match event {
            Event::Exited(result) => {
                status = result;
                break None;
            }
            Event::Kill(reason) => break Some(reason),
            Event::Sample => {
                if exceeds_memory(ctx.pid, ctx.memory_limit_bytes) {
                    break Some(KillReason::MemoryLimit);
                }
            }
        }
    };

    match killed {
        Some(KillReason::Cancelled) => {
            info!(job_id = %ctx.job_id, program = %ctx.program, "terminating process tree on request");
        }
        Some(reason) => {
            let violation = match reason {
                KillReason::MemoryLimit => "memory",
                _ => "timeout",
            };
            warn!(
                job_id = %ctx.job_id,
                program = %ctx.program,
                violation,
                elapsed_ms = ctx.started.elapsed().as_millis() as u64,
                "sandbox violation, killing process tree"
            );
        }
        None => {}
    }
    if killed.is_some() {
        status = terminate_tree(&mut child, ctx.pid, ctx.grace).await;
    }

    let drained = tokio::time::timeout(
        READER_DRAIN,
        futures::future::join_all(ctx.readers.iter_mut()),
    )
    .await
    .is_ok();
    if !drained {
        // Something in the group still holds the pipes open.
        debug!(job_id = %ctx.job_id, "output pipes still open after exit, killing group");
        #[cfg(unix)]
        if let Some(pid) = ctx.pid {
            limits::signal_group(pid, libc::SIGKILL);
        }
        for reader in &ctx.readers {
            reader.abort();
        }
    }

    let duration = ctx.started.elapsed();
    let exit_code = status.and_then(|s| s.code());
    debug!(
        job_id = %ctx.job_id,
        program = %ctx.program,
        exit_code = ?exit_code,
        elapsed_ms = duration.as_millis() as u64,
        "process finished"
    );

    ExecOutcome {
        job_id: ctx.job_id,
        program: ctx.program,
        exit_code,
        timed_out: killed == Some(KillReason::Timeout),
        killed_reason: killed,
        duration,
        stdout_tail: lock(&ctx.stdout_tail).snapshot(),
        stderr_tail: lock(&ctx.stderr_tail).snapshot(),
    }
}

fn exceeds_memory(pid: Option<u32>, limit: Option<u64>) -> bool {
    let (Some(pid), Some(limit)) = (pid, limit) else {
        return false;
    };
    limits::group_rss_bytes(pid).is_some_and(|rss| rss > limit)
}

/// SIGTERM the group, wait `grace`, then SIGKILL.
async fn terminate_tree(child: &mut Child, pid: Option<u32>, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        limits::signal_group(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = (child.start_kill(), pid);

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };
    // Reap stragglers that ignored SIGTERM or outlived the leader.
    #[cfg(unix)]
    if let Some(pid) = pid {
        limits::signal_group(pid, libc::SIGKILL);
    }
    status
}
