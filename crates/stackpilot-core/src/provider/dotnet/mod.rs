//! .NET desktop and web stacks: compiled projects previewed in a native
//! window.
//!
//! Every build and run first syncs the `.csproj` with the file tree so
//! files written by edits are compiled without anyone touching the project
//! file. Edits to XAML get their `x:Class` paired with the file's location
//! before they are validated and written.

pub mod diagnostics;
pub mod project_file;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::diagnostics::{BuildDiagnostics, parse_dependency_issues};
use self::project_file::{ItemKind, ProjectItem};
use super::readiness::{self, ReadinessRule};
use super::registry::RuntimeKind;
use super::scaffold;
use super::types::*;
use super::{
    PROBE_TIMEOUT, ProviderSettings, RuntimeProvider, classify_risk, prerequisite_report, probe_version,
    run_tool,
};
use crate::AppId;
use crate::edit::{self, EditOutcome, EditRequest};
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{ExecRequest, ExecutionKernel, NetworkPolicy, OutputCallback, RiskProfile};
use crate::logs::{OutputTaps, ProcessRole, RunMode};
use crate::validator::SourceKind;

pub const DOTNET_STACKS: &[&str] = &["wpf", "winui3", "winforms", "maui", "console", "blazor", "aspnet"];
const DESKTOP_STACKS: &[&str] = &["wpf", "winui3", "winforms", "maui"];

const HIGH_RISK: &[&str] = &["restore", "add", "nuget", "new"];
const MEDIUM_RISK: &[&str] = &["build", "publish", "pack"];

/// `dotnet new` short name for a stack.
fn dotnet_template(stack_type: &str) -> &str {
    match stack_type {
        "aspnet" => "web",
        other => other,
    }
}

/// What the provider remembers about a project between calls.
#[derive(Debug, Clone, Default)]
pub struct ProjectEditState {
    pub project_name: Option<String>,
    /// The `.csproj` builds and runs use.
    pub project_path: Option<PathBuf>,
    pub framework: Option<String>,
    pub files: BTreeMap<String, FileRecord>,
    /// `bin/<configuration>` of the last successful build.
    pub last_output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub kind: Option<ItemKind>,
    pub modified_at: DateTime<Utc>,
}

pub struct DotNetProvider {
    kernel: Arc<ExecutionKernel>,
    settings: ProviderSettings,
    descriptor: RuntimeDescriptor,
    states: Mutex<HashMap<AppId, ProjectEditState>>,
}

impl DotNetProvider {
    pub fn new(kernel: Arc<ExecutionKernel>, settings: ProviderSettings) -> Self {
        Self {
            kernel,
            settings,
            descriptor: RuntimeDescriptor::new(
                "dotnet",
                ".NET",
                PreviewStrategy::ExternalWindow,
                DOTNET_STACKS,
            ),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the per-app state, if any call has touched the app.
    pub fn project_state(&self, app_id: AppId) -> Option<ProjectEditState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&app_id)
            .cloned()
    }

    fn update_state(&self, app_id: AppId, update: impl FnOnce(&mut ProjectEditState)) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        update(states.entry(app_id).or_default());
    }

    fn exec(&self, app_id: AppId, cwd: &Path, args: Vec<String>) -> ExecRequest {
        let risk = self.risk_profile("dotnet", &args);
        ExecRequest::new("dotnet", cwd).for_app(app_id).args(args).risk(risk)
    }

    fn known_project_name(&self, app_id: AppId) -> Option<String> {
        self.project_state(app_id).and_then(|s| s.project_name)
    }

    async fn sync(&self, app_id: AppId, app_path: &Path) -> RuntimeResult<()> {
        let name = self.known_project_name(app_id);
        if project_file::sync_project(app_path, name.as_deref()).await? {
            info!(app_id, "project file synced with source tree");
        }
        self.remember_project(app_id, app_path, name.as_deref()).await;
        Ok(())
    }

    /// Record which project file the app builds from and what it targets.
    async fn remember_project(&self, app_id: AppId, app_path: &Path, name: Option<&str>) {
        let Some(csproj) = project_file::find_project_file(app_path, name).await else {
            return;
        };
        let framework = match tokio::fs::read_to_string(&csproj).await {
            Ok(text) => project_file::target_framework(&text),
            Err(e) => {
                debug!(app_id, project = %csproj.display(), error = %e, "could not read project file");
                None
            }
        };
        let stem = csproj.file_stem().map(|s| s.to_string_lossy().into_owned());
        self.update_state(app_id, |state| {
            if state.project_name.is_none() {
                state.project_name = stem;
            }
            state.framework = framework;
            state.project_path = Some(csproj);
        });
    }

    async fn scaffold_with_cli(&self, request: &ScaffoldRequest, name: &str) -> RuntimeResult<ScaffoldResult> {
        let args = vec![
            "new".to_owned(),
            dotnet_template(request.template()).to_owned(),
            "-n".to_owned(),
            name.to_owned(),
            "-o".to_owned(),
            ".".to_owned(),
        ];
        let exec = self
            .exec(0, &request.target_path, args)
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.install_timeout);
        let outcome = run_tool(&self.kernel, exec, None).await?;
        if outcome.success() {
            Ok(ScaffoldResult {
                success: true,
                entry_point: Some(format!("{name}.csproj")),
                error: None,
                warning: None,
            })
        } else {
            Ok(ScaffoldResult {
                success: false,
                error: Some(format!(
                    "dotnet new {} failed: {}",
                    request.template(),
                    outcome.last_error_line().unwrap_or("no output")
                )),
                ..ScaffoldResult::default()
            })
        }
    }

    /// Readiness for a stack: hosting messages for web stacks, a settle
    /// period for windows (which print nothing), clean exit for console apps.
    fn readiness_rule(&self, stack_type: &str) -> ReadinessRule {
        let rule = ReadinessRule::from_patterns(&[
            r"Application started",
            r"Now listening on",
            r"Hosting environment",
            r"Content root path",
        ])
        .expect("valid readiness pattern");
        match stack_type {
            "console" => rule.with_settle(self.settings.desktop_settle).ready_on_clean_exit(),
            s if DESKTOP_STACKS.contains(&s) => rule.with_settle(self.settings.desktop_settle),
            _ => rule,
        }
    }
}

/// The first `<project>.dll` under `bin/<configuration>`, searching target
/// framework subdirectories.
async fn find_build_output(app_path: &Path, configuration: BuildConfiguration, project: &str) -> Option<PathBuf> {
    let wanted = format!("{project}.dll");
    let mut pending = vec![app_path.join("bin").join(configuration.as_str())];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if entry.file_name().to_string_lossy().eq_ignore_ascii_case(&wanted) {
                return Some(path);
            }
        }
    }
    None
}

#[async_trait]
impl RuntimeProvider for DotNetProvider {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::DotNet
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

    fn readiness(&self, stack_type: &str) -> ReadinessRule {
        self.readiness_rule(stack_type)
    }

    async fn check_prerequisites(&self) -> PrerequisiteReport {
        let dotnet = probe_version(&self.kernel, "dotnet", PROBE_TIMEOUT).await;
        prerequisite_report(vec![(".NET SDK", "dotnet", dotnet)])
    }

    async fn scaffold(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult> {
        let name = project_file::sanitize_project_name(&request.project_name);
        scaffold::prepare_target(&request.target_path).await?;

        let result = match scaffold::template_source(self.settings.template_dir.as_deref(), request.template()) {
            Some(source) => {
                let copied = scaffold::copy_template(&source, &request.target_path).await?;
                project_file::instantiate_placeholders(&request.target_path, &name).await?;
                info!(project = %name, template = request.template(), files = copied, "scaffolded .NET project");
                let entry = project_file::find_project_file(&request.target_path, Some(&name))
                    .await
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
                ScaffoldResult {
                    success: true,
                    entry_point: entry.or_else(|| Some(format!("{name}.csproj"))),
                    error: None,
                    warning: None,
                }
            }
            None => self.scaffold_with_cli(request, &name).await?,
        };
        Ok(result)
    }

    async fn resolve_dependencies(
        &self,
        app_id: AppId,
        app_path: &Path,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<DependencyResult> {
        let exec = self
            .exec(app_id, app_path, vec!["restore".to_owned()])
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.install_timeout);
        let outcome = run_tool(&self.kernel, exec, output).await?;
        let issues = parse_dependency_issues(outcome.all_lines());
        for issue in &issues {
            warn!(app_id, issue = %issue, "restore problem");
        }
        if outcome.success() && issues.is_empty() {
            return Ok(DependencyResult {
                success: true,
                error: None,
            });
        }
        let error = if issues.is_empty() {
            format!(
                "dotnet restore exited with {:?}: {}",
                outcome.exit_code,
                outcome.last_error_line().unwrap_or("no output")
            )
        } else {
            issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
        };
        Ok(DependencyResult {
            success: false,
            error: Some(error),
        })
    }

    async fn build(&self, request: &BuildRequest, output: Option<OutputCallback>) -> RuntimeResult<BuildResult> {
        self.sync(request.app_id, &request.app_path).await?;

        let config = request.configuration.as_str();
        let args = ["build", "--configuration", config, "--verbosity", "normal"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        // Build may restore, hence restricted rather than no network.
        let exec = self
            .exec(request.app_id, &request.app_path, args)
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.build_timeout);
        let outcome = run_tool(&self.kernel, exec, output).await?;
        let diagnostics = BuildDiagnostics::parse(outcome.all_lines());
        let output_path = request.app_path.join("bin").join(config);

        let result = BuildResult::from_diagnostics(
            outcome.success(),
            diagnostics.error_strings(),
            diagnostics.warning_strings(),
            Some(output_path.clone()),
            || {
                format!(
                    "dotnet build exited with {:?}: {}",
                    outcome.exit_code,
                    outcome.last_error_line().unwrap_or("no output")
                )
            },
        );
        if result.success {
            self.update_state(request.app_id, |state| state.last_output = Some(output_path));
        }
        Ok(result)
    }

    async fn run(&self, request: &RunRequest, taps: OutputTaps, cancel: &CancellationToken) -> RuntimeResult<RunLaunch> {
        let mode = request.mode.unwrap_or_else(|| self.default_run_mode());
        let role = match mode {
            RunMode::FrontendOnly => ProcessRole::Frontend,
            RunMode::BackendOnly => ProcessRole::Backend,
            RunMode::Fullstack => {
                return Err(RuntimeError::Unsupported(
                    ".NET apps run as a single process; use frontend-only or backend-only".into(),
                ));
            }
        };
        self.sync(request.app_id, &request.app_path).await?;

        let args = match &request.start_command {
            Some(command) if command.program == "dotnet" => command.args.clone(),
            Some(command) => {
                return Err(RuntimeError::Unsupported(format!(
                    ".NET apps are started through dotnet, not {}",
                    command.program
                )));
            }
            None => ["run", "--configuration", request.configuration.as_str(), "--verbosity", "normal"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        };
        let exec = self
            .exec(request.app_id, &request.app_path, args)
            .network(NetworkPolicy::Full)
            .long_running();
        let ready = readiness::launch_until_ready(
            &self.kernel,
            exec,
            &self.readiness_rule(&request.stack_type),
            taps.for_role(role),
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
            mode,
            processes: vec![RoleProcess {
                role,
                handle: ready.handle,
            }],
        })
    }

    async fn start_preview(&self, options: &PreviewOptions) -> RuntimeResult<PreviewHandle> {
        let project = match self.known_project_name(options.app_id) {
            Some(name) => name,
            None => project_file::find_project_file(&options.app_path, None)
                .await
                .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .ok_or_else(|| {
                    RuntimeError::NotFound(format!("no .csproj in {}", options.app_path.display()))
                })?,
        };
        let dll = find_build_output(&options.app_path, options.configuration, &project)
            .await
            .ok_or_else(|| RuntimeError::NotFound("No executable found. Build the project first.".into()))?;
        let cwd = dll.parent().map_or_else(|| options.app_path.clone(), Path::to_path_buf);
        debug!(app_id = options.app_id, dll = %dll.display(), "launching preview window");

        let exec = self
            .exec(options.app_id, &cwd, vec![dll.to_string_lossy().into_owned()])
            .network(NetworkPolicy::Restricted)
            .long_running();
        let handle = self.kernel.spawn(exec, None, &CancellationToken::new()).await?;
        Ok(PreviewHandle {
            app_id: options.app_id,
            strategy: PreviewStrategy::ExternalWindow,
            url: None,
            process: Some(handle),
        })
    }

    async fn package(&self, options: &PackageOptions, output: Option<OutputCallback>) -> RuntimeResult<PackageResult> {
        let publish_dir = options.app_path.join("publish");
        let mut args: Vec<String> = vec![
            "publish".into(),
            "--configuration".into(),
            "Release".into(),
            "--output".into(),
            publish_dir.to_string_lossy().into_owned(),
            "--self-contained".into(),
            "true".into(),
            "--runtime".into(),
            format!("win-{}", options.architecture.as_str()),
        ];
        match options.output_format {
            PackageFormat::Exe => {}
            PackageFormat::SingleFile => args.push("-p:PublishSingleFile=true".into()),
            PackageFormat::Msix => {
                args.push("-p:GenerateAppxPackageOnBuild=true".into());
                args.push("-p:AppxPackageSigningEnabled=false".into());
            }
            PackageFormat::Msi => {
                return Err(RuntimeError::Unsupported(
                    "msi packaging needs an installer project; use exe, msix or single-file".into(),
                ));
            }
        }
        let exec = self
            .exec(options.app_id, &options.app_path, args)
            .network(NetworkPolicy::Restricted)
            .timeout(self.settings.build_timeout);
        let outcome = run_tool(&self.kernel, exec, output).await?;
        if outcome.success() {
            info!(app_id = options.app_id, format = %options.output_format, "published");
            return Ok(PackageResult {
                success: true,
                artifact_path: Some(publish_dir),
                error: None,
            });
        }
        let diagnostics = BuildDiagnostics::parse(outcome.all_lines());
        let error = if diagnostics.errors.is_empty() {
            format!(
                "dotnet publish exited with {:?}: {}",
                outcome.exit_code,
                outcome.last_error_line().unwrap_or("no output")
            )
        } else {
            diagnostics.error_strings().join("\n")
        };
        Ok(PackageResult {
            success: false,
            artifact_path: None,
            error: Some(error),
        })
    }

    async fn apply_edit(&self, request: &EditRequest) -> RuntimeResult<EditOutcome> {
        let relative = edit::resolve_in_root(Path::new(""), &request.file_path)?;
        let project_name = match &request.project_name {
            Some(name) => Some(name.clone()),
            None => match self.known_project_name(request.app_id) {
                Some(name) => Some(name),
                None => project_file::find_project_file(&request.app_path, None)
                    .await
                    .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned())),
            },
        };

        let content = match (&project_name, SourceKind::from_path(&relative)) {
            (Some(name), SourceKind::Markup) => project_file::pair_xaml(&request.content, name, &relative),
            _ => request.content.as_str().into(),
        };
        let kind = ItemKind::for_path(&relative);

        // A project file that cannot be synced fails the edit before the
        // source is touched.
        let pending = project_file::plan_sync(
            &request.app_path,
            project_name.as_deref(),
            kind.map(|k| ProjectItem::new(k, &relative)),
        )
        .await?;
        let target = request.app_path.join(&relative);
        let previous = tokio::fs::read(&target).await.ok();
        let outcome = edit::write_validated(&request.app_path, &request.file_path, &content).await?;
        if let Some(pending) = &pending {
            if let Err(e) = pending.commit().await {
                restore(&target, previous).await;
                return Err(e);
            }
        }

        let key = relative.to_string_lossy().replace('\\', "/");
        self.update_state(request.app_id, |state| {
            if state.project_name.is_none() {
                state.project_name = project_name;
            }
            state.files.insert(
                key,
                FileRecord {
                    kind,
                    modified_at: Utc::now(),
                },
            );
        });
        Ok(outcome)
    }

    async fn forget(&self, app_id: AppId) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&app_id);
    }
}

/// Put a file back the way it was before a failed edit.
async fn restore(path: &Path, previous: Option<Vec<u8>>) {
    let restored = match previous {
        Some(bytes) => edit::write_atomic(path, &bytes).await,
        None => tokio::fs::remove_file(path)
            .await
            .map_err(|e| RuntimeError::io(path, e)),
    };
    if let Err(e) = restored {
        warn!(path = %path.display(), error = %e, "could not roll back edited file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;

    fn provider() -> DotNetProvider {
        let config = OrchestratorConfig::default();
        let kernel = Arc::new(ExecutionKernel::new(config.kernel_config()));
        let settings = ProviderSettings::from(&config);
        DotNetProvider::new(kernel, settings)
    }

    const PROJECT: &str = "<Project Sdk=\"Microsoft.NET.Sdk\">\n  <PropertyGroup>\n    <UseWPF>true</UseWPF>\n  </PropertyGroup>\n</Project>\n";

    #[test]
    fn readiness_depends_on_stack() {
        let p = provider();
        assert!(p.readiness("aspnet").matches("info: Now listening on: http://localhost:5000"));
        assert!(p.readiness("wpf").settle_after.is_some());
        assert!(p.readiness("console").ready_on_clean_exit);
        assert!(!p.readiness("aspnet").ready_on_clean_exit);
    }

    #[test]
    fn restore_is_high_risk_and_build_medium() {
        let p = provider();
        assert_eq!(p.risk_profile("dotnet", &["restore".to_owned()]), RiskProfile::High);
        assert_eq!(p.risk_profile("dotnet", &["build".to_owned()]), RiskProfile::Medium);
        assert_eq!(p.risk_profile("dotnet", &["--version".to_owned()]), RiskProfile::Low);
    }

    #[tokio::test]
    async fn xaml_edit_is_paired_written_and_declared() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Demo.csproj"), PROJECT).unwrap();
        let p = provider();

        let xaml = r#"<UserControl xmlns="http://schemas.microsoft.com/winfx/2006/xaml/presentation" xmlns:x="http://schemas.microsoft.com/winfx/2006/xaml"><Grid></Grid></UserControl>"#;
        let outcome = p
            .apply_edit(&EditRequest {
                app_id: 4,
                app_path: dir.path().to_path_buf(),
                file_path: "Views/Card.xaml".into(),
                content: xaml.into(),
                project_name: None,
            })
            .await
            .unwrap();
        assert!(outcome.created);

        let written = std::fs::read_to_string(dir.path().join("Views/Card.xaml")).unwrap();
        assert!(written.contains(r#"x:Class="Demo.Views.Card""#));
        let csproj = std::fs::read_to_string(dir.path().join("Demo.csproj")).unwrap();
        assert!(csproj.contains(r#"<Page Include="Views\Card.xaml" />"#));

        let state = p.project_state(4).unwrap();
        assert_eq!(state.project_name.as_deref(), Some("Demo"));
        assert_eq!(state.files["Views/Card.xaml"].kind, Some(ItemKind::Page));

        p.forget(4).await;
        assert!(p.project_state(4).is_none());
    }

    #[tokio::test]
    async fn invalid_edit_leaves_project_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Demo.csproj"), PROJECT).unwrap();
        let p = provider();

        let err = p
            .apply_edit(&EditRequest {
                app_id: 1,
                app_path: dir.path().to_path_buf(),
                file_path: "Broken.cs".into(),
                content: "class".into(),
                project_name: Some("Demo".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
        assert!(!dir.path().join("Broken.cs").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("Demo.csproj")).unwrap(), PROJECT);
        assert!(p.project_state(1).is_none());
    }

    #[tokio::test]
    async fn unsyncable_project_file_fails_the_edit_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let truncated = "<Project Sdk=\"Microsoft.NET.Sdk\">\n  <PropertyGroup>\n  </PropertyGroup>\n";
        std::fs::write(dir.path().join("Demo.csproj"), truncated).unwrap();
        std::fs::write(dir.path().join("Existing.cs"), "class Existing {}\n").unwrap();
        let p = provider();

        for (file, content) in [
            (
                "Models/Card.cs",
                "namespace Demo.Models;\n\npublic class Card\n{\n    public string Title { get; set; } = \"\";\n}\n",
            ),
            (
                "Existing.cs",
                "namespace Demo;\n\npublic class Existing\n{\n    public int Count { get; set; }\n}\n",
            ),
        ] {
            let err = p
                .apply_edit(&EditRequest {
                    app_id: 2,
                    app_path: dir.path().to_path_buf(),
                    file_path: file.into(),
                    content: content.into(),
                    project_name: Some("Demo".into()),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::Build { .. }), "{file}: {err}");
        }

        assert!(!dir.path().join("Models/Card.cs").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Existing.cs")).unwrap(),
            "class Existing {}\n"
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("Demo.csproj")).unwrap(), truncated);
        assert!(p.project_state(2).is_none());
    }

    #[tokio::test]
    async fn syncing_remembers_project_file_and_framework() {
        let dir = tempfile::tempdir().unwrap();
        let project = "<Project Sdk=\"Microsoft.NET.Sdk\">\n  <PropertyGroup>\n    <TargetFramework>net8.0-windows</TargetFramework>\n  </PropertyGroup>\n</Project>\n";
        std::fs::write(dir.path().join("Gallery.csproj"), project).unwrap();
        let p = provider();

        // Build and run both sync first.
        p.sync(5, dir.path()).await.unwrap();

        let state = p.project_state(5).unwrap();
        assert_eq!(state.project_name.as_deref(), Some("Gallery"));
        assert_eq!(state.project_path, Some(dir.path().join("Gallery.csproj")));
        assert_eq!(state.framework.as_deref(), Some("net8.0-windows"));
    }

    #[tokio::test]
    async fn msi_packaging_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = provider()
            .package(
                &PackageOptions {
                    app_id: 1,
                    app_path: dir.path().to_path_buf(),
                    stack_type: "wpf".into(),
                    output_format: PackageFormat::Msi,
                    architecture: Architecture::X64,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported(_)));
    }

    #[tokio::test]
    async fn finds_dll_under_target_framework_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bin/Debug/net8.0-windows");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("Demo.dll"), "").unwrap();
        let found = find_build_output(dir.path(), BuildConfiguration::Debug, "Demo").await;
        assert_eq!(found, Some(out.join("Demo.dll")));
        assert!(find_build_output(dir.path(), BuildConfiguration::Release, "Demo").await.is_none());
    }
}
