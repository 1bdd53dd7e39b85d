//! Launching a long-running process and waiting for it to become ready.

use std::borrow::Cow;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{ExecRequest, ExecutionKernel, KillReason, OutputCallback, OutputLine, ProcessHandle};

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));
static LOCAL_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):\d+/?[^\s]*").expect("valid regex")
});

/// What counts as "ready" for a given stack.
#[derive(Debug, Clone, Default)]
pub struct ReadinessRule {
    patterns: Vec<Regex>,
    pub(crate) settle_after: Option<Duration>,
    pub(crate) ready_on_clean_exit: bool,
}

impl ReadinessRule {
    /// Case-insensitive line patterns.
    pub fn from_patterns(patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            patterns,
            ..Self::default()
        })
    }

    /// A process still alive after `settle` counts as ready even without a
    /// matching line.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle_after = Some(settle);
        self
    }

    /// Exit code 0 before any signal counts as ready (run-to-completion apps).
    pub fn ready_on_clean_exit(mut self) -> Self {
        self.ready_on_clean_exit = true;
        self
    }

    pub fn matches(&self, line: &str) -> bool {
        let line = strip_ansi(line);
        self.patterns.iter().any(|p| p.is_match(&line))
    }
}

pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE_RE.replace_all(text, "")
}

/// First loopback URL in a line, as dev servers print on startup.
pub fn find_local_url(line: &str) -> Option<String> {
    LOCAL_URL_RE
        .find(&strip_ansi(line))
        .map(|m| m.as_str().trim_end_matches(['/', '.', ',']).to_owned())
}

/// A process that has signalled readiness.
#[derive(Debug, Clone)]
pub struct ReadyProcess {
    pub handle: ProcessHandle,
    pub url: Option<String>,
}

enum Step {
    Ready,
    Settled,
    Exited,
    TimedOut,
}

/// Spawn `request` and wait for `rule` to be satisfied.
///
/// Fails with [`RuntimeError::RuntimeStart`] if the process exits first or
/// nothing matches within `timeout` (in which case the tree is killed), and
/// with [`RuntimeError::SandboxViolation`] if the kernel killed it.
pub async fn launch_until_ready(
    kernel: &ExecutionKernel,
    request: ExecRequest,
    rule: &ReadinessRule,
    tap: Option<OutputCallback>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> RuntimeResult<ReadyProcess> {
    let (ready_tx, mut ready_rx) = watch::channel(false);
    let url = Arc::new(Mutex::new(None::<String>));

    let callback: OutputCallback = {
        let rule = rule.clone();
        let url = url.clone();
        Arc::new(move |line: OutputLine| {
            if let Some(found) = find_local_url(&line.text) {
                url.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(found);
            }
            if rule.matches(&line.text) {
                ready_tx.send_replace(true);
            }
            if let Some(tap) = &tap {
                tap(line);
            }
        })
    };

    let program = request.program.clone();
    let handle = kernel.spawn(request, Some(callback), cancel).await?;
    let settle = rule.settle_after;

    let step = tokio::select! {
        biased;
        res = ready_rx.wait_for(|ready| *ready) => if res.is_ok() { Step::Ready } else { Step::Exited },
        _ = handle.wait() => Step::Exited,
        () = sleep_or_pending(settle) => Step::Settled,
        () = tokio::time::sleep(timeout) => Step::TimedOut,
    };

    let url = url.lock().unwrap_or_else(PoisonError::into_inner).clone();
    match step {
        Step::Ready | Step::Settled => {
            info!(program = %program, pid = ?handle.pid(), url = ?url, settled = matches!(step, Step::Settled), "process ready");
            Ok(ReadyProcess { handle, url })
        }
        Step::TimedOut => {
            let _ = handle.terminate_and_wait().await;
            Err(not_ready(&program, timeout))
        }
        Step::Exited => {
            // Output closed; the process itself may still be winding down.
            let outcome = match tokio::time::timeout(timeout, handle.wait()).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    let _ = handle.terminate_and_wait().await;
                    return Err(not_ready(&program, timeout));
                }
            };
            if let Some(violation) = outcome.violation() {
                return Err(violation);
            }
            if outcome.killed_reason == Some(KillReason::Cancelled) {
                return Err(RuntimeError::RuntimeStart(format!(
                    "{program} was stopped before it became ready"
                )));
            }
            if rule.ready_on_clean_exit && outcome.exit_code == Some(0) {
                debug!(program = %program, "process ran to completion");
                return Ok(ReadyProcess { handle, url });
            }
            let code = outcome
                .exit_code
                .map_or_else(|| "a signal".to_owned(), |c| format!("code {c}"));
            let detail = outcome
                .last_error_line()
                .map(|l| format!(": {l}"))
                .unwrap_or_default();
            Err(RuntimeError::RuntimeStart(format!(
                "{program} exited with {code} before signalling readiness{detail}"
            )))
        }
    }
}

fn not_ready(program: &str, timeout: Duration) -> RuntimeError {
    RuntimeError::RuntimeStart(format!(
        "no readiness signal from {program} within {}s",
        timeout.as_secs()
    ))
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_before_matching() {
        let rule = ReadinessRule::from_patterns(&[r"ready in \d+ ms"]).unwrap();
        assert!(rule.matches("\x1b[32mVITE\x1b[39m v5.0.0  \x1b[1mready in 312 ms\x1b[22m"));
        assert!(!rule.matches("compiling..."));
    }

    #[test]
    fn patterns_are_case_insensitive() {
        let rule = ReadinessRule::from_patterns(&["now listening on"]).unwrap();
        assert!(rule.matches("info: Now listening on: http://localhost:5000"));
    }

    #[test]
    fn finds_loopback_urls() {
        assert_eq!(
            find_local_url("  ➜  Local:   \x1b[36mhttp://localhost:\x1b[1m5173\x1b[22m/\x1b[39m").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(
            find_local_url("Now listening on: http://127.0.0.1:5000.").as_deref(),
            Some("http://127.0.0.1:5000")
        );
        assert_eq!(find_local_url("see https://example.com:443"), None);
    }
}
