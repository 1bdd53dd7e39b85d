//! Node.js / web stacks: a dev server embedded as an iframe preview.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::readiness::{self, ReadinessRule};
use super::registry::RuntimeKind;
use super::scaffold;
use super::types::*;
use super::{
    PROBE_TIMEOUT, ProviderSettings, RuntimeProvider, classify_risk, prerequisite_report, probe_version,
    run_tool,
};
use crate::AppId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{ExecRequest, ExecutionKernel, NetworkPolicy, OutputCallback, RiskProfile};
use crate::logs::{OutputTaps, ProcessRole, RunMode};

pub const NODE_STACKS: &[&str] = &[
    "react",
    "next",
    "nextjs",
    "vue",
    "angular",
    "svelte",
    "astro",
    "solid",
    "qwik",
    "remix",
    "nuxt",
    "gatsby",
    "vite",
    "parcel",
    "webpack",
    "rollup",
    "esbuild",
    "turbopack",
    "express-react",
];

const HIGH_RISK: &[&str] = &["install", "add", "i", "ci"];
const MEDIUM_RISK: &[&str] = &["build"];

/// Backend ports sit this far above the frontend port for the same app.
const BACKEND_PORT_OFFSET: u16 = 10_000;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\berror\b|npm ERR!|ERR_PNPM|failed to compile").expect("valid regex")
});
static WARNING_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwarn(ing)?\b").expect("valid regex"));

/// Lock file decides the package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    pub fn detect(app_path: &Path) -> Self {
        if app_path.join("pnpm-lock.yaml").is_file() {
            Self::Pnpm
        } else if app_path.join("yarn.lock").is_file() {
            Self::Yarn
        } else {
            Self::Npm
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
        }
    }

    pub fn install_args(self) -> Vec<String> {
        match self {
            // Generated projects frequently pin mismatched peer ranges.
            Self::Npm => vec!["install".into(), "--legacy-peer-deps".into()],
            Self::Pnpm | Self::Yarn => vec!["install".into()],
        }
    }

    /// `run <script> [--] <extra...>`; npm needs the separator.
    pub fn script_args(self, script: &str, extra: &[String]) -> Vec<String> {
        let mut args = vec!["run".to_owned(), script.to_owned()];
        if !extra.is_empty() {
            if self == Self::Npm {
                args.push("--".into());
            }
            args.extend(extra.iter().cloned());
        }
        args
    }
}

pub struct NodeProvider {
    kernel: Arc<ExecutionKernel>,
    settings: ProviderSettings,
    descriptor: RuntimeDescriptor,
    frontend_ready: ReadinessRule,
    backend_ready: ReadinessRule,
}

impl NodeProvider {
    pub fn new(kernel: Arc<ExecutionKernel>, settings: ProviderSettings) -> Self {
        let frontend_ready = ReadinessRule::from_patterns(&[r"https?://(localhost|127\.0\.0\.1):\d+"])
            .expect("valid readiness pattern");
        let backend_ready = ReadinessRule::from_patterns(&[
            r"listening",
            r"\brunning\b",
            r"\bstarted\b",
            r"\bready\b",
        ])
        .expect("valid readiness pattern")
        .with_settle(settings.desktop_settle);
        Self {
            kernel,
            descriptor: RuntimeDescriptor::new("node", "Node.js", PreviewStrategy::Iframe, NODE_STACKS),
            settings,
            frontend_ready,
            backend_ready,
        }
    }

    fn exec(&self, app_id: AppId, cwd: &Path, program: &str, args: Vec<String>) -> ExecRequest {
        let risk = self.risk_profile(program, &args);
        ExecRequest::new(program, cwd).for_app(app_id).args(args).risk(risk)
    }

    async fn install(
        &self,
        app_id: AppId,
        cwd: &Path,
        command: Option<&CommandSpec>,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<DependencyResult> {
        let (program, args) = match command {
            Some(spec) => (spec.program.clone(), spec.args.clone()),
            None => {
                let pm = PackageManager::detect(cwd);
                (pm.program().to_owned(), pm.install_args())
            }
        };
        let request = self
            .exec(app_id, cwd, &program, args)
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.install_timeout);
        let outcome = run_tool(&self.kernel, request, output).await?;
        if outcome.success() {
            return Ok(DependencyResult {
                success: true,
                error: None,
            });
        }
        let mut lines: Vec<&str> = outcome
            .all_lines()
            .filter(|l| ERROR_LINE_RE.is_match(l))
            .map(str::trim)
            .collect();
        lines.dedup();
        let error = if lines.is_empty() {
            format!(
                "{program} exited with {:?}: {}",
                outcome.exit_code,
                outcome.last_error_line().unwrap_or("no output")
            )
        } else {
            lines.join("\n")
        };
        Ok(DependencyResult {
            success: false,
            error: Some(error),
        })
    }

    async fn ensure_installed(
        &self,
        app_id: AppId,
        cwd: &Path,
        command: Option<&CommandSpec>,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<()> {
        // An explicit install command always runs; the default only when
        // nothing is installed yet.
        if command.is_none() && cwd.join("node_modules").is_dir() {
            return Ok(());
        }
        let result = self.install(app_id, cwd, command, output).await?;
        if result.success {
            Ok(())
        } else {
            Err(RuntimeError::DependencyResolution(
                result.error.unwrap_or_default(),
            ))
        }
    }

    async fn launch_backend(
        &self,
        request: &RunRequest,
        spec: Option<&BackendSpec>,
        tap: Option<OutputCallback>,
        port: u16,
        cancel: &CancellationToken,
    ) -> RuntimeResult<RoleProcess> {
        let (cwd, command, install) = match spec {
            Some(spec) => (
                request.app_path.join(&spec.path),
                spec.start_command.clone(),
                spec.install_command.as_ref(),
            ),
            None => (
                request.app_path.clone(),
                self.start_command(&request.app_path, request.start_command.as_ref(), "start", &[]),
                request.install_command.as_ref(),
            ),
        };
        self.ensure_installed(request.app_id, &cwd, install, tap.clone())
            .await?;

        let exec = self
            .exec(request.app_id, &cwd, &command.program, command.args)
            .network(NetworkPolicy::Full)
            .env("PORT", port.to_string())
            .long_running();
        let ready = readiness::launch_until_ready(
            &self.kernel,
            exec,
            &self.backend_ready,
            tap,
            self.settings.readiness_timeout,
            cancel,
        )
        .await?;
        Ok(RoleProcess {
            role: ProcessRole::Backend,
            handle: ready.handle,
        })
    }

    fn start_command(&self, cwd: &Path, explicit: Option<&CommandSpec>, script: &str, extra: &[String]) -> CommandSpec {
        explicit.cloned().unwrap_or_else(|| {
            let pm = PackageManager::detect(cwd);
            CommandSpec::new(pm.program(), pm.script_args(script, extra))
        })
    }
}

/// Scripts declared in `package.json`, if it parses.
async fn has_script(app_path: &Path, script: &str) -> bool {
    let Ok(text) = tokio::fs::read_to_string(app_path.join("package.json")).await else {
        return false;
    };
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|json| json.get("scripts")?.get(script).cloned())
        .is_some()
}

fn first_existing(app_path: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|c| app_path.join(c))
        .find(|p| p.exists())
}

#[async_trait]
impl RuntimeProvider for NodeProvider {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Node
    }

    fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    fn default_run_mode(&self) -> RunMode {
        RunMode::FrontendOnly
    }

    fn risk_profile(&self, program: &str, args: &[String]) -> RiskProfile {
        classify_risk(program, args, HIGH_RISK, MEDIUM_RISK)
    }

    fn readiness(&self, _stack_type: &str) -> ReadinessRule {
        self.frontend_ready.clone()
    }

    async fn check_prerequisites(&self) -> PrerequisiteReport {
        let (node, npm) = tokio::join!(
            probe_version(&self.kernel, "node", PROBE_TIMEOUT),
            probe_version(&self.kernel, "npm", PROBE_TIMEOUT),
        );
        prerequisite_report(vec![("Node.js", "node", node), ("npm", "npm", npm)])
    }

    async fn scaffold(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult> {
        let template = request.template();
        let source = scaffold::template_source(self.settings.template_dir.as_deref(), template)
            .ok_or_else(|| {
                RuntimeError::Scaffold(format!(
                    "template {template:?} not found in the template repository"
                ))
            })?;
        scaffold::prepare_target(&request.target_path).await?;
        scaffold::copy_template(&source, &request.target_path).await?;
        info!(project = %request.project_name, template, "scaffolded node project");

        let entry_point = first_existing(&request.target_path, &["src/main.tsx", "src/main.ts", "package.json"])
            .and_then(|p| p.strip_prefix(&request.target_path).ok().map(|p| p.display().to_string()));
        Ok(ScaffoldResult {
            success: true,
            entry_point,
            error: None,
            warning: None,
        })
    }

    async fn resolve_dependencies(
        &self,
        app_id: AppId,
        app_path: &Path,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<DependencyResult> {
        self.install(app_id, app_path, None, output).await
    }

    async fn build(&self, request: &BuildRequest, output: Option<OutputCallback>) -> RuntimeResult<BuildResult> {
        if !has_script(&request.app_path, "build").await {
            return Ok(BuildResult {
                success: true,
                output_path: None,
                errors: Vec::new(),
                warnings: vec!["package.json defines no build script; nothing to build".into()],
            });
        }
        let pm = PackageManager::detect(&request.app_path);
        let exec = self
            .exec(request.app_id, &request.app_path, pm.program(), pm.script_args("build", &[]))
            .network(NetworkPolicy::None)
            .env("NODE_ENV", match request.configuration {
                BuildConfiguration::Debug => "development",
                BuildConfiguration::Release => "production",
            })
            .timeout(self.settings.build_timeout);
        let outcome = run_tool(&self.kernel, exec, output).await?;

        // JS tooling has no structured diagnostics; "error" only means
        // something when the build actually failed.
        let errors = if outcome.success() {
            Vec::new()
        } else {
            let mut errors: Vec<String> = outcome
                .all_lines()
                .filter(|l| ERROR_LINE_RE.is_match(l))
                .map(|l| l.trim().to_owned())
                .collect();
            errors.dedup();
            errors.truncate(50);
            errors
        };
        let warnings = outcome
            .all_lines()
            .filter(|l| WARNING_LINE_RE.is_match(l))
            .map(|l| l.trim().to_owned())
            .collect();

        Ok(BuildResult::from_diagnostics(
            outcome.success(),
            errors,
            warnings,
            first_existing(&request.app_path, &["dist", "build", ".next", "out"]),
            || {
                format!(
                    "build exited with {:?}: {}",
                    outcome.exit_code,
                    outcome.last_error_line().unwrap_or("no output")
                )
            },
        ))
    }

    async fn run(&self, request: &RunRequest, taps: OutputTaps, cancel: &CancellationToken) -> RuntimeResult<RunLaunch> {
        let mode = request.mode.unwrap_or(if request.backend.is_some() {
            RunMode::Fullstack
        } else {
            self.default_run_mode()
        });
        let port = self.settings.port_for(request.app_id);
        let backend_port = port.saturating_add(BACKEND_PORT_OFFSET);
        let mut processes = Vec::new();

        if mode != RunMode::FrontendOnly {
            let backend = self
                .launch_backend(
                    request,
                    request.backend.as_ref(),
                    taps.for_role(ProcessRole::Backend),
                    backend_port,
                    cancel,
                )
                .await?;
            processes.push(backend);
        }

        if mode == RunMode::BackendOnly {
            let handle = &processes[0].handle;
            return Ok(RunLaunch {
                result: RunResult {
                    process_id: handle.pid(),
                    ready: true,
                    job_id: Some(handle.job_id()),
                    url: Some(format!("http://localhost:{backend_port}")),
                    ..RunResult::default()
                },
                mode,
                processes,
            });
        }

        let tap = taps.for_role(ProcessRole::Frontend);
        let frontend = async {
            self.ensure_installed(
                request.app_id,
                &request.app_path,
                request.install_command.as_ref(),
                tap.clone(),
            )
            .await?;

            let command = self.start_command(
                &request.app_path,
                request.start_command.as_ref(),
                "dev",
                &["--port".to_owned(), port.to_string()],
            );
            let mut exec = self
                .exec(request.app_id, &request.app_path, &command.program, command.args)
                .network(NetworkPolicy::Full)
                .env("PORT", port.to_string())
                .env("BROWSER", "none")
                .long_running();
            if mode == RunMode::Fullstack {
                exec = exec.env("BACKEND_URL", format!("http://localhost:{backend_port}"));
            }
            readiness::launch_until_ready(
                &self.kernel,
                exec,
                &self.frontend_ready,
                tap.clone(),
                self.settings.readiness_timeout,
                cancel,
            )
            .await
        }
        .await;

        let ready = match frontend {
            Ok(ready) => ready,
            Err(e) => {
                if !processes.is_empty() {
                    warn!(app_id = request.app_id, "frontend failed to start, stopping backend");
                    let _ = super::stop_processes(&processes).await;
                }
                return Err(e);
            }
        };

        let result = RunResult {
            process_id: ready.handle.pid(),
            ready: true,
            error: None,
            job_id: Some(ready.handle.job_id()),
            url: ready.url.or_else(|| Some(format!("http://localhost:{port}"))),
            violation: None,
        };
        processes.push(RoleProcess {
            role: ProcessRole::Frontend,
            handle: ready.handle,
        });
        Ok(RunLaunch {
            result,
            mode,
            processes,
        })
    }

    async fn start_preview(&self, options: &PreviewOptions) -> RuntimeResult<PreviewHandle> {
        // The running dev server is the preview; nothing to launch.
        Ok(PreviewHandle {
            app_id: options.app_id,
            strategy: PreviewStrategy::Iframe,
            url: options
                .url
                .clone()
                .or_else(|| Some(format!("http://localhost:{}", self.settings.port_for(options.app_id)))),
            process: None,
        })
    }

    async fn package(&self, options: &PackageOptions, _output: Option<OutputCallback>) -> RuntimeResult<PackageResult> {
        Err(RuntimeError::Unsupported(format!(
            "{} apps are deployed from their build output; {} packaging is not available",
            options.stack_type, options.output_format
        )))
    }
}
