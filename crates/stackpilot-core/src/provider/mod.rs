//! Runtime providers: the polymorphic contract, its three variants and
//! the registry that resolves a stack type to one of them.

pub mod dotnet;
pub mod node;
pub mod readiness;
pub mod registry;
pub mod scaffold;
pub mod tauri;
mod trait_def;
pub mod types;

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use registry::{ProviderRegistry, RegistryError, RuntimeKind};
pub use trait_def::RuntimeProvider;
pub use types::*;

use crate::config::OrchestratorConfig;
use crate::error::RuntimeResult;
use crate::kernel::{ExecOutcome, ExecRequest, ExecutionKernel, NetworkPolicy, OutputCallback, RiskProfile};

/// Upper bound for a `--version` probe.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts and paths every provider needs.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub build_timeout: Duration,
    pub install_timeout: Duration,
    pub readiness_timeout: Duration,
    pub desktop_settle: Duration,
    pub dev_server_base_port: u16,
    pub template_dir: Option<PathBuf>,
}

impl From<&OrchestratorConfig> for ProviderSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            build_timeout: config.build_timeout(),
            install_timeout: config.install_timeout(),
            readiness_timeout: config.readiness_timeout(),
            desktop_settle: config.desktop_settle(),
            dev_server_base_port: config.runtime.dev_server_base_port,
            template_dir: config.runtime.template_dir.clone(),
        }
    }
}

impl ProviderSettings {
    /// Dev-server port for an app: stable per app id, spread over a
    /// 10000-port window above the base.
    pub fn port_for(&self, app_id: crate::AppId) -> u16 {
        // The modulus keeps the offset well inside u16.
        let offset = (app_id % 10_000) as u16;
        self.dev_server_base_port.saturating_add(offset)
    }
}

/// Classify a command line by keyword token: anything touching the network
/// or installing code is high risk, heavy compilation is medium.
pub(crate) fn classify_risk(program: &str, args: &[String], high: &[&str], medium: &[&str]) -> RiskProfile {
    let tokens: Vec<String> = std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(str::to_ascii_lowercase)
        .collect();
    let any = |keywords: &[&str]| tokens.iter().any(|t| keywords.contains(&t.as_str()));
    if any(high) {
        RiskProfile::High
    } else if any(medium) {
        RiskProfile::Medium
    } else {
        RiskProfile::Low
    }
}

/// Run a tool to completion. Kernel kills surface as sandbox violations;
/// a non-zero exit is left for the caller to interpret.
pub(crate) async fn run_tool(
    kernel: &ExecutionKernel,
    request: ExecRequest,
    output: Option<OutputCallback>,
) -> RuntimeResult<ExecOutcome> {
    let outcome = kernel.execute(request, output, &CancellationToken::new()).await?;
    match outcome.violation() {
        Some(violation) => Err(violation),
        None => Ok(outcome),
    }
}

/// `<program> --version` under no network. `None` if the tool is missing
/// or fails.
pub(crate) async fn probe_version(kernel: &ExecutionKernel, program: &str, timeout: Duration) -> Option<String> {
    let cwd = std::env::temp_dir();
    let request = ExecRequest::new(program, cwd)
        .args(["--version"])
        .network(NetworkPolicy::None)
        .timeout(timeout);
    match kernel.execute(request, None, &CancellationToken::new()).await {
        Ok(outcome) if outcome.success() => Some(
            outcome
                .stdout_tail
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty())
                .unwrap_or_default()
                .to_owned(),
        ),
        Ok(outcome) => {
            debug!(program, exit_code = ?outcome.exit_code, "version probe failed");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "version probe failed");
            None
        }
    }
}

/// Build a prerequisite report from `(display name, probe result)` pairs.
pub(crate) fn prerequisite_report(probes: Vec<(&str, &str, Option<String>)>) -> PrerequisiteReport {
    let mut report = PrerequisiteReport::default();
    for (display, tool, version) in probes {
        match version {
            Some(version) => {
                report.versions.insert(tool.to_owned(), version);
            }
            None => report.missing.push(display.to_owned()),
        }
    }
    report.ready = report.missing.is_empty();
    report
}

/// Terminate every process, wait for them, and return the primary's exit
/// code. Idempotent.
pub(crate) async fn stop_processes(processes: &[RoleProcess]) -> RuntimeResult<Option<i32>> {
    for process in processes {
        process.handle.terminate();
    }
    let primary = types::primary_process(processes).map(|p| p.handle.job_id());
    let mut exit_code = None;
    for process in processes {
        let outcome = process.handle.wait().await?;
        if Some(outcome.job_id) == primary {
            exit_code = outcome.exit_code;
        }
    }
    Ok(exit_code)
}
