//! Request and result types shared by every runtime provider.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppId;
use crate::kernel::{KillReason, ProcessHandle};
use crate::logs::{ProcessRole, RunMode};

// -----------------------------------------------------------------------
// Descriptors
// -----------------------------------------------------------------------

/// How a running app is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreviewStrategy {
    /// Dev server embedded in a web view.
    Iframe,
    /// Native OS window, not embeddable.
    ExternalWindow,
    ConsoleOutput,
    /// Native shell hosting a web view.
    Hybrid,
}

impl std::fmt::Display for PreviewStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Iframe => "iframe",
            Self::ExternalWindow => "external-window",
            Self::ConsoleOutput => "console-output",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Immutable metadata for one provider variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub runtime_id: String,
    pub runtime_name: String,
    pub preview_strategy: PreviewStrategy,
    pub supported_stack_types: BTreeSet<String>,
}

impl RuntimeDescriptor {
    pub fn new(
        runtime_id: &str,
        runtime_name: &str,
        preview_strategy: PreviewStrategy,
        stacks: &[&str],
    ) -> Self {
        Self {
            runtime_id: runtime_id.to_owned(),
            runtime_name: runtime_name.to_owned(),
            preview_strategy,
            supported_stack_types: stacks.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    pub fn supports(&self, stack_type: &str) -> bool {
        self.supported_stack_types
            .contains(&stack_type.to_ascii_lowercase())
    }
}

/// Toolchain availability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteReport {
    pub ready: bool,
    /// Human-readable names of missing tools ("Node.js", ".NET SDK").
    pub missing: Vec<String>,
    /// Tool name to reported version.
    pub versions: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------
// Scaffold / resolve / build
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaffoldRequest {
    pub project_name: String,
    pub target_path: PathBuf,
    pub stack_type: String,
    /// Defaults to the stack type.
    pub template_id: Option<String>,
}

impl ScaffoldRequest {
    pub fn template(&self) -> &str {
        self.template_id.as_deref().unwrap_or(&self.stack_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldResult {
    pub success: bool,
    pub entry_point: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildConfiguration {
    #[default]
    Debug,
    Release,
}

impl BuildConfiguration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "Debug",
            Self::Release => "Release",
        }
    }
}

impl std::fmt::Display for BuildConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildConfiguration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            other => Err(format!("unknown build configuration {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub app_id: AppId,
    pub app_path: PathBuf,
    pub stack_type: String,
    pub configuration: BuildConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl BuildResult {
    /// A build with any error is a failure regardless of the exit code;
    /// warnings never affect success.
    pub fn from_diagnostics(
        exit_ok: bool,
        mut errors: Vec<String>,
        warnings: Vec<String>,
        output_path: Option<PathBuf>,
        fallback_error: impl FnOnce() -> String,
    ) -> Self {
        if !exit_ok && errors.is_empty() {
            errors.push(fallback_error());
        }
        Self {
            success: errors.is_empty(),
            output_path,
            errors,
            warnings,
        }
    }
}

// -----------------------------------------------------------------------
// Run
// -----------------------------------------------------------------------

/// A program and its arguments, without a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line on whitespace. Quoting is not interpreted;
    /// commands are never run through a shell.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Backend half of a full-stack run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Relative to the app path unless absolute.
    pub path: PathBuf,
    pub start_command: CommandSpec,
    pub install_command: Option<CommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub app_id: AppId,
    pub app_path: PathBuf,
    pub stack_type: String,
    #[serde(default)]
    pub configuration: BuildConfiguration,
    pub install_command: Option<CommandSpec>,
    pub start_command: Option<CommandSpec>,
    /// Defaults to the provider's natural mode.
    pub mode: Option<RunMode>,
    pub backend: Option<BackendSpec>,
}

impl RunRequest {
    pub fn new(app_id: AppId, app_path: impl Into<PathBuf>, stack_type: impl Into<String>) -> Self {
        Self {
            app_id,
            app_path: app_path.into(),
            stack_type: stack_type.into(),
            configuration: BuildConfiguration::Debug,
            install_command: None,
            start_command: None,
            mode: None,
            backend: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub process_id: Option<u32>,
    /// True only once a readiness signal was observed.
    pub ready: bool,
    pub error: Option<String>,
    pub job_id: Option<Uuid>,
    /// Where an iframe or hybrid preview should point.
    pub url: Option<String>,
    /// Set when the kernel killed the run for exceeding a limit.
    pub violation: Option<KillReason>,
}

impl RunResult {
    pub fn failed(error: impl Into<String>, violation: Option<KillReason>) -> Self {
        Self {
            error: Some(error.into()),
            violation,
            ..Self::default()
        }
    }
}

/// A process launched by `run`, tagged with its role.
#[derive(Debug, Clone)]
pub struct RoleProcess {
    pub role: ProcessRole,
    pub handle: ProcessHandle,
}

/// Everything `run` hands back: the result plus ownership of the processes.
#[derive(Debug)]
pub struct RunLaunch {
    pub result: RunResult,
    pub mode: RunMode,
    pub processes: Vec<RoleProcess>,
}

impl RunLaunch {
    /// The process whose exit ends the run: the frontend if there is one.
    pub fn primary(&self) -> Option<&RoleProcess> {
        primary_process(&self.processes)
    }
}

pub(crate) fn primary_process(processes: &[RoleProcess]) -> Option<&RoleProcess> {
    processes
        .iter()
        .find(|p| p.role == ProcessRole::Frontend)
        .or_else(|| processes.first())
}

// -----------------------------------------------------------------------
// Preview / package
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewOptions {
    pub app_id: AppId,
    pub app_path: PathBuf,
    pub stack_type: String,
    #[serde(default)]
    pub configuration: BuildConfiguration,
    /// URL reported by the run, if any.
    pub url: Option<String>,
}

/// A live preview. External-window previews own a process.
#[derive(Debug, Clone)]
pub struct PreviewHandle {
    pub app_id: AppId,
    pub strategy: PreviewStrategy,
    pub url: Option<String>,
    pub process: Option<ProcessHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageFormat {
    Exe,
    Msi,
    Msix,
    SingleFile,
}

impl std::fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Exe => "exe",
            Self::Msi => "msi",
            Self::Msix => "msix",
            Self::SingleFile => "single-file",
        })
    }
}

impl std::str::FromStr for PackageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exe" => Ok(Self::Exe),
            "msi" => Ok(Self::Msi),
            "msix" => Ok(Self::Msix),
            "single-file" => Ok(Self::SingleFile),
            other => Err(format!("unknown package format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    X64,
    X86,
    Arm64,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::X86 => "x86",
            Self::Arm64 => "arm64",
        }
    }
}

impl std::str::FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x64" => Ok(Self::X64),
            "x86" => Ok(Self::X86),
            "arm64" => Ok(Self::Arm64),
            other => Err(format!("unknown architecture {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageOptions {
    pub app_id: AppId,
    pub app_path: PathBuf,
    pub stack_type: String,
    pub output_format: PackageFormat,
    #[serde(default)]
    pub architecture: Architecture,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    pub success: bool,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_errors_force_failure_even_on_clean_exit() {
        let result = BuildResult::from_diagnostics(
            true,
            vec!["Main.cs(3,1): error CS1002: ; expected".into()],
            vec![],
            None,
            String::new,
        );
        assert!(!result.success);
    }

    #[test]
    fn warnings_never_fail_a_build() {
        let result =
            BuildResult::from_diagnostics(true, vec![], vec!["warning CS0168".into()], None, String::new);
        assert!(result.success);
    }

    #[test]
    fn failed_exit_without_parsed_errors_gets_fallback() {
        let result = BuildResult::from_diagnostics(false, vec![], vec![], None, || "exit 1".into());
        assert!(!result.success);
        assert_eq!(result.errors, vec!["exit 1"]);
    }

    #[test]
    fn parses_command_lines() {
        let spec = CommandSpec::parse("  npm run dev  ").unwrap();
        assert_eq!(spec, CommandSpec::new("npm", ["run", "dev"]));
        assert_eq!(spec.to_string(), "npm run dev");
        assert!(CommandSpec::parse("   ").is_none());
    }

    #[test]
    fn package_format_uses_kebab_case_names() {
        assert_eq!("single-file".parse::<PackageFormat>(), Ok(PackageFormat::SingleFile));
        assert!("dmg".parse::<PackageFormat>().is_err());
        assert_eq!(PackageFormat::SingleFile.to_string(), "single-file");
    }
}
