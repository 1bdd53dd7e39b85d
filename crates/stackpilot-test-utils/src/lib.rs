//! Shared fixtures for stackpilot integration tests.
//!
//! Nothing here needs a real toolchain: [`ScriptedProvider`] drives
//! `sh -c` scripts through the real execution kernel, and
//! [`test_kernel_config`] allows only the handful of POSIX tools those
//! scripts use.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stackpilot_core::AppId;
use stackpilot_core::config::OrchestratorConfig;
use stackpilot_core::error::{RuntimeError, RuntimeResult};
use stackpilot_core::kernel::{ExecRequest, ExecutionKernel, KernelConfig, OutputCallback, RiskProfile};
use stackpilot_core::logs::{OutputTaps, ProcessRole, RunMode};
use stackpilot_core::orchestrator::Orchestrator;
use stackpilot_core::provider::readiness::{ReadinessRule, launch_until_ready};
use stackpilot_core::provider::{
    BuildRequest, BuildResult, DependencyResult, PackageOptions, PackageResult, PrerequisiteReport,
    PreviewHandle, PreviewOptions, PreviewStrategy, ProviderRegistry, RoleProcess, RunLaunch,
    RunRequest, RunResult, RuntimeDescriptor, RuntimeKind, RuntimeProvider, ScaffoldRequest,
    ScaffoldResult,
};

/// The line every scripted process prints once it is "up".
pub const READY_LINE: &str = "server ready";

/// Kernel limits suited to tests: short timeouts, a one-second kill grace
/// and only shell utilities on the allow-list.
pub fn test_kernel_config() -> KernelConfig {
    KernelConfig {
        default_timeout: Duration::from_secs(10),
        default_memory_limit_mb: 0,
        memory_sample_interval: Duration::from_millis(100),
        kill_grace: Duration::from_secs(1),
        allowed_programs: ["sh", "sleep", "echo", "true", "false", "cat"]
            .into_iter()
            .map(str::to_owned)
            .collect::<HashSet<_>>(),
        allowed_hosts: vec!["registry.npmjs.org".to_owned()],
    }
}

pub fn test_kernel() -> Arc<ExecutionKernel> {
    Arc::new(ExecutionKernel::new(test_kernel_config()))
}

/// Orchestrator config whose hot-reload watcher is a shell script.
pub fn test_config(watch_script: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.runtime.readiness_timeout_secs = 5;
    config.runtime.prerequisite_cache_ttl_secs = 60;
    config.logs.sink_capacity = 500;
    config.hot_reload.watch_program = "sh".into();
    config.hot_reload.watch_args = vec!["-c".into(), watch_script.into()];
    config.hot_reload.dotnet_flags = false;
    config.hot_reload.prebuild = false;
    config
}

// -----------------------------------------------------------------------
// Scripted provider
// -----------------------------------------------------------------------

/// What a [`ScriptedProvider`] does when called.
#[derive(Debug, Clone)]
pub struct Script {
    pub prerequisites: PrerequisiteReport,
    /// `sh -c` body for the frontend process.
    pub frontend: Option<String>,
    /// `sh -c` body for the backend process.
    pub backend: Option<String>,
    pub ready_pattern: String,
    pub readiness_timeout: Duration,
    pub build_delay: Duration,
    pub build_errors: Vec<String>,
    pub default_mode: RunMode,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            prerequisites: PrerequisiteReport {
                ready: true,
                ..PrerequisiteReport::default()
            },
            frontend: Some(format!("echo '{READY_LINE}'; exec sleep 30")),
            backend: None,
            ready_pattern: READY_LINE.to_owned(),
            readiness_timeout: Duration::from_secs(5),
            build_delay: Duration::ZERO,
            build_errors: Vec::new(),
            default_mode: RunMode::FrontendOnly,
        }
    }
}

/// A provider whose processes are shell scripts.
pub struct ScriptedProvider {
    kind: RuntimeKind,
    descriptor: RuntimeDescriptor,
    kernel: Arc<ExecutionKernel>,
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(kind: RuntimeKind, stacks: &[&str], kernel: Arc<ExecutionKernel>) -> Self {
        let strategy = match kind {
            RuntimeKind::Node => PreviewStrategy::Iframe,
            RuntimeKind::DotNet => PreviewStrategy::ExternalWindow,
            RuntimeKind::Tauri => PreviewStrategy::Hybrid,
        };
        let id = format!("scripted-{kind}");
        Self {
            kind,
            descriptor: RuntimeDescriptor::new(&id, &id, strategy, stacks),
            kernel,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace part of the script.
    pub fn edit_script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn script(&self) -> Script {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Operation names in call order, e.g. `["check", "build", "run"]`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.to_owned());
    }

    async fn launch(
        &self,
        request: &RunRequest,
        body: &str,
        role: ProcessRole,
        taps: &OutputTaps,
        script: &Script,
        cancel: &CancellationToken,
    ) -> RuntimeResult<RoleProcess> {
        let rule = ReadinessRule::from_patterns(&[script.ready_pattern.as_str()])
            .map_err(|e| RuntimeError::RuntimeStart(e.to_string()))?;
        let exec = ExecRequest::new("sh", &request.app_path)
            .for_app(request.app_id)
            .args(["-c", body])
            .long_running();
        let ready = launch_until_ready(
            &self.kernel,
            exec,
            &rule,
            taps.for_role(role),
            script.readiness_timeout,
            cancel,
        )
        .await?;
        Ok(RoleProcess {
            role,
            handle: ready.handle,
        })
    }
}

#[async_trait]
impl RuntimeProvider for ScriptedProvider {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    fn default_run_mode(&self) -> RunMode {
        self.script().default_mode
    }

    fn risk_profile(&self, _program: &str, _args: &[String]) -> RiskProfile {
        RiskProfile::Low
    }

    fn readiness(&self, _stack_type: &str) -> ReadinessRule {
        ReadinessRule::from_patterns(&[self.script().ready_pattern.as_str()]).unwrap_or_default()
    }

    async fn check_prerequisites(&self) -> PrerequisiteReport {
        self.record("check");
        self.script().prerequisites
    }

    async fn scaffold(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult> {
        self.record("scaffold");
        stackpilot_core::provider::scaffold::prepare_target(&request.target_path).await?;
        Ok(ScaffoldResult {
            success: true,
            entry_point: Some("main.sh".into()),
            ..ScaffoldResult::default()
        })
    }

    async fn resolve_dependencies(
        &self,
        _app_id: AppId,
        _app_path: &Path,
        _output: Option<OutputCallback>,
    ) -> RuntimeResult<DependencyResult> {
        self.record("resolve");
        Ok(DependencyResult {
            success: true,
            error: None,
        })
    }

    async fn build(&self, request: &BuildRequest, _output: Option<OutputCallback>) -> RuntimeResult<BuildResult> {
        self.record("build");
        let script = self.script();
        tokio::time::sleep(script.build_delay).await;
        Ok(BuildResult::from_diagnostics(
            true,
            script.build_errors,
            Vec::new(),
            Some(request.app_path.join("out")),
            String::new,
        ))
    }

    async fn run(&self, request: &RunRequest, taps: OutputTaps, cancel: &CancellationToken) -> RuntimeResult<RunLaunch> {
        self.record("run");
        let script = self.script();
        let mode = request.mode.unwrap_or(script.default_mode);
        let mut processes = Vec::new();
        if mode != RunMode::FrontendOnly {
            if let Some(body) = &script.backend {
                let backend = self
                    .launch(request, body, ProcessRole::Backend, &taps, &script, cancel)
                    .await?;
                processes.push(backend);
            }
        }
        if mode != RunMode::BackendOnly {
            if let Some(body) = &script.frontend {
                match self
                    .launch(request, body, ProcessRole::Frontend, &taps, &script, cancel)
                    .await
                {
                    Ok(frontend) => processes.push(frontend),
                    Err(e) => {
                        for process in &processes {
                            let _ = process.handle.terminate_and_wait().await;
                        }
                        return Err(e);
                    }
                }
            }
        }
        let Some(primary) = processes
            .iter()
            .find(|p| p.role == ProcessRole::Frontend)
            .or_else(|| processes.first())
        else {
            return Err(RuntimeError::RuntimeStart("script launches nothing".into()));
        };
        let result = RunResult {
            process_id: primary.handle.pid(),
            ready: true,
            job_id: Some(primary.handle.job_id()),
            ..RunResult::default()
        };
        Ok(RunLaunch {
            result,
            mode,
            processes,
        })
    }

    async fn start_preview(&self, options: &PreviewOptions) -> RuntimeResult<PreviewHandle> {
        self.record("preview");
        Ok(PreviewHandle {
            app_id: options.app_id,
            strategy: self.descriptor.preview_strategy,
            url: options.url.clone(),
            process: None,
        })
    }

    async fn package(&self, options: &PackageOptions, _output: Option<OutputCallback>) -> RuntimeResult<PackageResult> {
        self.record("package");
        Ok(PackageResult {
            success: true,
            artifact_path: Some(options.app_path.join("dist").join(options.output_format.to_string())),
            error: None,
        })
    }
}

/// One scripted provider per runtime kind, with disjoint stacks:
/// `web` (node), `desktop`/`wpf` (dotnet) and `hybrid` (tauri).
pub struct ScriptedRuntimes {
    pub node: Arc<ScriptedProvider>,
    pub dotnet: Arc<ScriptedProvider>,
    pub tauri: Arc<ScriptedProvider>,
}

impl ScriptedRuntimes {
    pub fn new(kernel: &Arc<ExecutionKernel>) -> Self {
        Self {
            node: Arc::new(ScriptedProvider::new(RuntimeKind::Node, &["web"], kernel.clone())),
            dotnet: Arc::new(ScriptedProvider::new(
                RuntimeKind::DotNet,
                &["desktop", "wpf"],
                kernel.clone(),
            )),
            tauri: Arc::new(ScriptedProvider::new(RuntimeKind::Tauri, &["hybrid"], kernel.clone())),
        }
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new(self.node.clone(), self.dotnet.clone(), self.tauri.clone())
            .expect("scripted stacks are disjoint")
    }
}

/// An orchestrator over scripted providers and the test kernel.
pub fn scripted_orchestrator(watch_script: &str) -> (Orchestrator, ScriptedRuntimes) {
    let kernel = test_kernel();
    let runtimes = ScriptedRuntimes::new(&kernel);
    let orchestrator = Orchestrator::with_registry(test_config(watch_script), kernel, runtimes.registry());
    (orchestrator, runtimes)
}

// -----------------------------------------------------------------------
// Project fixtures
// -----------------------------------------------------------------------

/// A temporary app directory, removed on drop.
pub struct TestApp {
    pub dir: TempDir,
}

impl TestApp {
    pub fn empty() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create fixture dir");
        }
        std::fs::write(&path, contents).expect("failed to write fixture file");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(relative)).expect("failed to read fixture file")
    }

    /// A minimal WPF project named `name`.
    pub fn wpf(name: &str) -> Self {
        let app = Self::empty();
        app.write(
            &format!("{name}.csproj"),
            r#"<Project Sdk="Microsoft.NET.Sdk">
  <PropertyGroup>
    <OutputType>WinExe</OutputType>
    <TargetFramework>net8.0-windows</TargetFramework>
    <UseWPF>true</UseWPF>
  </PropertyGroup>
</Project>
"#,
        );
        app.write(
            "App.xaml",
            &format!(
                r#"<Application x:Class="{name}.App"
             xmlns="http://schemas.microsoft.com/winfx/2006/xaml/presentation"
             xmlns:x="http://schemas.microsoft.com/winfx/2006/xaml"
             StartupUri="MainWindow.xaml">
</Application>
"#
            ),
        );
        app.write(
            "App.xaml.cs",
            &format!(
                "using System.Windows;\n\nnamespace {name}\n{{\n    public partial class App : Application\n    {{\n    }}\n}}\n"
            ),
        );
        app
    }

    /// A minimal Vite-style package.
    pub fn node() -> Self {
        let app = Self::empty();
        app.write(
            "package.json",
            r#"{ "name": "fixture", "private": true, "scripts": { "dev": "vite", "build": "vite build" } }"#,
        );
        app
    }
}

/// Markup that passes the validator.
pub fn valid_window_xaml(class: &str) -> String {
    format!(
        r#"<Window x:Class="{class}"
        xmlns="http://schemas.microsoft.com/winfx/2006/xaml/presentation"
        xmlns:x="http://schemas.microsoft.com/winfx/2006/xaml"
        Title="Main" Height="450" Width="800">
    <Grid>
        <TextBlock Text="Hello" />
    </Grid>
</Window>
"#
    )
}

/// C# code-behind that passes the validator.
pub fn valid_code_behind(namespace: &str, class: &str) -> String {
    format!(
        "using System.Windows;\n\nnamespace {namespace}\n{{\n    public partial class {class} : Window\n    {{\n        public {class}()\n        {{\n            InitializeComponent();\n        }}\n    }}\n}}\n"
    )
}
