//! Tauri: a Rust shell hosting a web frontend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::node::PackageManager;
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
use crate::kernel::{ExecOutcome, ExecRequest, ExecutionKernel, NetworkPolicy, OutputCallback, RiskProfile};
use crate::logs::{OutputTaps, ProcessRole, RunMode};

pub const TAURI_STACKS: &[&str] = &["tauri", "tauri-react", "tauri-vue", "tauri-svelte", "tauri-solid"];

const HIGH_RISK: &[&str] = &["install", "add", "create"];
const MEDIUM_RISK: &[&str] = &["build"];

const SHELL_DIR: &str = "src-tauri";
const ENTRY_POINT: &str = "src-tauri/src/main.rs";
const INIT_WARNING: &str =
    "Tauri init may need manual setup. Run: npm install @tauri-apps/cli --save-dev && npx tauri init";

static CARGO_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*error(\[E\d+\])?:").expect("valid regex"));
static CARGO_WARNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*warning(\[\w+\])?:").expect("valid regex"));

/// `error[..]:`/`error:` lines are errors, `warning:` lines are warnings.
/// Cargo's closing summary ("could not compile ...") is kept as an error.
pub fn parse_cargo_diagnostics<'a>(lines: impl IntoIterator<Item = &'a str>) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if CARGO_ERROR_RE.is_match(line) {
            if !errors.iter().any(|e| e == trimmed) {
                errors.push(trimmed.to_owned());
            }
        } else if CARGO_WARNING_RE.is_match(line) && !warnings.iter().any(|w| w == trimmed) {
            warnings.push(trimmed.to_owned());
        }
    }
    (errors, warnings)
}

/// Vite template for the frontend half of a stack.
fn vite_template(stack_type: &str) -> &'static str {
    match stack_type.strip_prefix("tauri-").unwrap_or("react") {
        "vue" => "vue-ts",
        "svelte" => "svelte-ts",
        "solid" => "solid-ts",
        _ => "react-ts",
    }
}

fn target_triple(architecture: Architecture) -> &'static str {
    match architecture {
        Architecture::X64 => "x86_64-pc-windows-msvc",
        Architecture::X86 => "i686-pc-windows-msvc",
        Architecture::Arm64 => "aarch64-pc-windows-msvc",
    }
}

pub struct TauriProvider {
    kernel: Arc<ExecutionKernel>,
    settings: ProviderSettings,
    descriptor: RuntimeDescriptor,
    ready: ReadinessRule,
}

impl TauriProvider {
    pub fn new(kernel: Arc<ExecutionKernel>, settings: ProviderSettings) -> Self {
        let ready = ReadinessRule::from_patterns(&[
            r"dev server running",
            r"localhost:\d+",
            r"running on http",
            r"vite.*ready",
            r"compiled successfully",
        ])
        .expect("valid readiness pattern");
        Self {
            kernel,
            descriptor: RuntimeDescriptor::new("tauri", "Tauri", PreviewStrategy::Hybrid, TAURI_STACKS),
            settings,
            ready,
        }
    }

    fn exec(&self, app_id: AppId, cwd: &Path, program: &str, args: Vec<String>) -> ExecRequest {
        let risk = self.risk_profile(program, &args);
        ExecRequest::new(program, cwd).for_app(app_id).args(args).risk(risk)
    }

    fn npm(&self, app_id: AppId, cwd: &Path, args: &[&str]) -> ExecRequest {
        self.exec(app_id, cwd, "npm", args.iter().map(|a| (*a).to_owned()).collect())
    }

    async fn scaffold_with_toolchain(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult> {
        let cwd = &request.target_path;
        let create = self
            .npm(0, cwd, &["create", "vite@latest", ".", "--", "--template", vite_template(&request.stack_type)])
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.install_timeout);
        let outcome = run_tool(&self.kernel, create, None).await?;
        if !outcome.success() {
            return Ok(ScaffoldResult {
                success: false,
                error: Some(format!(
                    "Frontend scaffolding failed: {}",
                    outcome.last_error_line().unwrap_or("no output")
                )),
                ..ScaffoldResult::default()
            });
        }

        let init = self
            .npm(0, cwd, &["run", "tauri", "init", "--", "--ci"])
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.install_timeout);
        let warning = match run_tool(&self.kernel, init, None).await {
            Ok(outcome) if outcome.success() => None,
            Ok(outcome) => {
                warn!(project = %request.project_name, exit_code = ?outcome.exit_code, "tauri init failed");
                Some(INIT_WARNING.to_owned())
            }
            Err(e) => {
                warn!(project = %request.project_name, error = %e, "tauri init failed");
                Some(INIT_WARNING.to_owned())
            }
        };
        Ok(ScaffoldResult {
            success: true,
            entry_point: Some(ENTRY_POINT.to_owned()),
            error: None,
            warning,
        })
    }

    async fn install(&self, app_id: AppId, cwd: &Path, output: Option<OutputCallback>) -> RuntimeResult<DependencyResult> {
        let pm = PackageManager::detect(cwd);
        let request = self
            .exec(app_id, cwd, pm.program(), pm.install_args())
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.install_timeout);
        let outcome = run_tool(&self.kernel, request, output).await?;
        Ok(DependencyResult {
            success: outcome.success(),
            error: (!outcome.success()).then(|| failure_summary(pm.program(), &outcome)),
        })
    }
}

fn failure_summary(program: &str, outcome: &ExecOutcome) -> String {
    format!(
        "{program} exited with {:?}: {}",
        outcome.exit_code,
        outcome.last_error_line().unwrap_or("no output")
    )
}

#[async_trait]
impl RuntimeProvider for TauriProvider {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Tauri
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
        self.ready.clone()
    }

    async fn check_prerequisites(&self) -> PrerequisiteReport {
        let (node, rustc, cargo) = tokio::join!(
            probe_version(&self.kernel, "node", PROBE_TIMEOUT),
            probe_version(&self.kernel, "rustc", PROBE_TIMEOUT),
            probe_version(&self.kernel, "cargo", PROBE_TIMEOUT),
        );
        prerequisite_report(vec![
            ("Node.js", "node", node),
            ("Rust", "rustc", rustc),
            ("Cargo", "cargo", cargo),
        ])
    }

    async fn scaffold(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult> {
        scaffold::prepare_target(&request.target_path).await?;
        match scaffold::template_source(self.settings.template_dir.as_deref(), request.template()) {
            Some(source) => {
                scaffold::copy_template(&source, &request.target_path).await?;
                info!(project = %request.project_name, template = request.template(), "scaffolded tauri project");
                Ok(ScaffoldResult {
                    success: true,
                    entry_point: Some(ENTRY_POINT.to_owned()),
                    error: None,
                    warning: None,
                })
            }
            None => self.scaffold_with_toolchain(request).await,
        }
    }

    async fn resolve_dependencies(
        &self,
        app_id: AppId,
        app_path: &Path,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<DependencyResult> {
        // Crates are fetched by the first cargo build.
        self.install(app_id, app_path, output).await
    }

    async fn build(&self, request: &BuildRequest, output: Option<OutputCallback>) -> RuntimeResult<BuildResult> {
        let shell = request.app_path.join(SHELL_DIR);
        let profile_dir = match request.configuration {
            BuildConfiguration::Debug => "debug",
            BuildConfiguration::Release => "release",
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut exit_ok = true;

        if shell.join("Cargo.toml").is_file() {
            let mut args = vec!["build".to_owned()];
            if request.configuration == BuildConfiguration::Release {
                args.push("--release".into());
            }
            let cargo = self
                .exec(request.app_id, &shell, "cargo", args)
                .network(NetworkPolicy::Restricted)
                .timeout(self.settings.build_timeout);
            let outcome = run_tool(&self.kernel, cargo, output.clone()).await?;
            let (cargo_errors, cargo_warnings) = parse_cargo_diagnostics(outcome.all_lines());
            warnings.extend(cargo_warnings);
            if !outcome.success() {
                exit_ok = false;
                errors.extend(cargo_errors);
                if errors.is_empty() {
                    errors.push(failure_summary("cargo", &outcome));
                }
                // No point bundling a frontend for a shell that didn't compile.
                return Ok(BuildResult::from_diagnostics(exit_ok, errors, warnings, None, String::new));
            }
        } else {
            warnings.push(format!("{SHELL_DIR}/Cargo.toml not found; skipped native build"));
        }

        let pm = PackageManager::detect(&request.app_path);
        let frontend = self
            .exec(request.app_id, &request.app_path, pm.program(), pm.script_args("build", &[]))
            .network(NetworkPolicy::None)
            .timeout(self.settings.build_timeout);
        let outcome = run_tool(&self.kernel, frontend, output).await?;
        if !outcome.success() {
            exit_ok = false;
            errors.push(failure_summary(pm.program(), &outcome));
        }

        let output_path: PathBuf = shell.join("target").join(profile_dir);
        Ok(BuildResult::from_diagnostics(
            exit_ok,
            errors,
            warnings,
            Some(output_path),
            String::new,
        ))
    }

    async fn run(&self, request: &RunRequest, taps: OutputTaps, cancel: &CancellationToken) -> RuntimeResult<RunLaunch> {
        let tap = taps.for_role(ProcessRole::Frontend);
        if !request.app_path.join("node_modules").is_dir() {
            let installed = self.install(request.app_id, &request.app_path, tap.clone()).await?;
            if !installed.success {
                return Err(RuntimeError::DependencyResolution(installed.error.unwrap_or_default()));
            }
        }

        let command = request
            .start_command
            .clone()
            .unwrap_or_else(|| CommandSpec::new("npm", ["run", "tauri", "dev"]));
        let exec = self
            .exec(request.app_id, &request.app_path, &command.program, command.args)
            .network(NetworkPolicy::Full)
            .env("BROWSER", "none")
            .long_running();
        let ready = readiness::launch_until_ready(
            &self.kernel,
            exec,
            &self.ready,
            tap,
            self.settings.readiness_timeout,
            cancel,
        )
        .await?;

        Ok(RunLaunch {
            result: RunResult {
                process_id: ready.handle.pid(),
                ready: true,
                error: None,
                job_id: Some(ready.handle.job_id()),
                url: ready.url.clone(),
                violation: None,
            },
            mode: RunMode::FrontendOnly,
            processes: vec![RoleProcess {
                role: ProcessRole::Frontend,
                handle: ready.handle,
            }],
        })
    }

    async fn start_preview(&self, options: &PreviewOptions) -> RuntimeResult<PreviewHandle> {
        // `tauri dev` already opened the native window around the web view.
        Ok(PreviewHandle {
            app_id: options.app_id,
            strategy: PreviewStrategy::Hybrid,
            url: options.url.clone(),
            process: None,
        })
    }

    async fn package(&self, options: &PackageOptions, output: Option<OutputCallback>) -> RuntimeResult<PackageResult> {
        let bundle = match options.output_format {
            PackageFormat::Exe => "nsis",
            PackageFormat::Msi => "msi",
            other => {
                return Err(RuntimeError::Unsupported(format!(
                    "Tauri bundles exe and msi installers, not {other}"
                )));
            }
        };
        let triple = target_triple(options.architecture);
        let request = self
            .npm(
                options.app_id,
                &options.app_path,
                &["run", "tauri", "build", "--", "--bundles", bundle, "--target", triple],
            )
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.build_timeout);
        let outcome = run_tool(&self.kernel, request, output).await?;
        if !outcome.success() {
            let (errors, _) = parse_cargo_diagnostics(outcome.all_lines());
            return Ok(PackageResult {
                success: false,
                artifact_path: None,
                error: Some(if errors.is_empty() {
                    failure_summary("tauri build", &outcome)
                } else {
                    errors.join("\n")
                }),
            });
        }
        let artifact = options
            .app_path
            .join(SHELL_DIR)
            .join("target")
            .join(triple)
            .join("release")
            .join("bundle")
            .join(bundle);
        info!(app_id = options.app_id, artifact = %artifact.display(), "tauri bundle created");
        Ok(PackageResult {
            success: true,
            artifact_path: Some(artifact),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cargo_diagnostics_split_errors_and_warnings() {
        let output = "\
   Compiling app v0.1.0 (/tmp/app/src-tauri)
warning: unused variable: `x`
error[E0425]: cannot find value `y` in this scope
 --> src/main.rs:4:13
error: could not compile `app` (bin \"app\") due to 1 previous error
warning: unused variable: `x`";
        let (errors, warnings) = parse_cargo_diagnostics(output.lines());
        assert_eq!(
            errors,
            vec![
                "error[E0425]: cannot find value `y` in this scope",
                "error: could not compile `app` (bin \"app\") due to 1 previous error",
            ]
        );
        assert_eq!(warnings, vec!["warning: unused variable: `x`"]);
    }

    #[test]
    fn compiling_lines_are_not_errors() {
        let (errors, _) = parse_cargo_diagnostics(["   Compiling serde v1.0.0"]);
        assert!(errors.is_empty());
    }

    #[test]
    fn frontend_template_follows_stack_suffix() {
        assert_eq!(vite_template("tauri"), "react-ts");
        assert_eq!(vite_template("tauri-vue"), "vue-ts");
        assert_eq!(vite_template("tauri-svelte"), "svelte-ts");
        assert_eq!(vite_template("tauri-unknown"), "react-ts");
    }
}
