//! Error taxonomy shared by every orchestration component.

use std::path::PathBuf;

use thiserror::Error;

use crate::AppId;
use crate::kernel::{KernelError, KillReason};

/// Failures surfaced by providers, the lifecycle controller and the
/// orchestrator.
///
/// Every variant carries the raw diagnostic text so that a human (or an
/// upstream code-editing agent) can act on it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A required toolchain is not installed.
    #[error("missing toolchain: {}", missing.join(", "))]
    PrerequisiteMissing { missing: Vec<String> },

    /// The target path is not empty or the template does not exist.
    #[error("scaffold failed: {0}")]
    Scaffold(String),

    /// Package restore failed (network, registry, unknown package).
    #[error("dependency resolution failed: {0}")]
    DependencyResolution(String),

    /// Compiler or bundler errors, verbatim.
    #[error("build failed: {}", errors.join("; "))]
    Build { errors: Vec<String> },

    /// The process failed before its readiness signal.
    #[error("runtime failed to start: {0}")]
    RuntimeStart(String),

    /// The kernel killed the process tree for exceeding a limit.
    #[error("sandbox violation ({reason}): {detail}")]
    SandboxViolation { reason: KillReason, detail: String },

    /// The edit validator rejected new file content.
    #[error("edit rejected: {0}")]
    Validation(String),

    /// Another run/build/stop is already in flight for this app.
    #[error("app {0} is busy with another operation")]
    Busy(AppId),

    /// A hot-reload session is already starting or active for this app.
    #[error("hot reload session already active for app {0}")]
    SessionActive(AppId),

    /// Unknown stack type, app, session or file.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation is not offered by this runtime.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The kernel refused or failed to spawn a process.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Filesystem failure outside the kernel.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Whether the caller may retry the same request later.
    ///
    /// Nothing in this crate retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::DependencyResolution(_))
    }

    /// Whether this failure came from a kernel limit kill rather than the
    /// project's own code.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(self, Self::SandboxViolation { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_and_dependency_errors_are_retryable() {
        assert!(RuntimeError::Busy(1).is_retryable());
        assert!(RuntimeError::DependencyResolution("offline".into()).is_retryable());
        assert!(!RuntimeError::Build { errors: vec![] }.is_retryable());
        assert!(!RuntimeError::RuntimeStart("boom".into()).is_retryable());
        assert!(
            !RuntimeError::SandboxViolation {
                reason: KillReason::Timeout,
                detail: String::new(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn prerequisite_message_lists_missing_tools() {
        let err = RuntimeError::PrerequisiteMissing {
            missing: vec!["Node.js".into(), "Cargo".into()],
        };
        assert_eq!(err.to_string(), "missing toolchain: Node.js, Cargo");
    }

    #[test]
    fn sandbox_violation_is_flagged() {
        let err = RuntimeError::SandboxViolation {
            reason: KillReason::MemoryLimit,
            detail: "rss 900MB > 512MB".into(),
        };
        assert!(err.is_sandbox_violation());
        assert!(err.to_string().contains("memory"));
    }
}
