//! The `RuntimeProvider` trait: one implementation per stack family.
//!
//! The trait is object-safe so the registry can hold
//! `Arc<dyn RuntimeProvider>` values.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::readiness::ReadinessRule;
use super::registry::RuntimeKind;
use super::types::{
    BuildRequest, BuildResult, DependencyResult, PackageOptions, PackageResult, PrerequisiteReport,
    PreviewHandle, PreviewOptions, RoleProcess, RunLaunch, RunRequest, RuntimeDescriptor,
    ScaffoldRequest, ScaffoldResult,
};
use crate::AppId;
use crate::edit::{self, EditOutcome, EditRequest};
use crate::error::RuntimeResult;
use crate::kernel::{OutputCallback, RiskProfile};
use crate::logs::{OutputTaps, RunMode};

/// Scaffold, resolve, build, run, preview and package for one stack family.
///
/// Providers are stateless across calls except for caches they own
/// (the .NET provider's per-app edit state). Every process they start goes
/// through the execution kernel, and `run` hands ownership of those
/// processes back to the caller in a [`RunLaunch`].
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn descriptor(&self) -> &RuntimeDescriptor;

    /// Mode used when a run request does not name one.
    fn default_run_mode(&self) -> RunMode;

    fn risk_profile(&self, program: &str, args: &[String]) -> RiskProfile;

    /// What counts as a readiness signal for `stack_type`.
    fn readiness(&self, stack_type: &str) -> ReadinessRule;

    fn is_ready_signal(&self, stack_type: &str, line: &str) -> bool {
        self.readiness(stack_type).matches(line)
    }

    async fn check_prerequisites(&self) -> PrerequisiteReport;

    /// Create a new project. The target must be empty or absent.
    async fn scaffold(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult>;

    async fn resolve_dependencies(
        &self,
        app_id: AppId,
        app_path: &Path,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<DependencyResult>;

    async fn build(
        &self,
        request: &BuildRequest,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<BuildResult>;

    /// Launch the app and wait for its readiness signal.
    ///
    /// Cancelling `cancel` tears down everything launched so far.
    async fn run(
        &self,
        request: &RunRequest,
        taps: OutputTaps,
        cancel: &CancellationToken,
    ) -> RuntimeResult<RunLaunch>;

    /// Terminate a run's processes and return the primary exit code.
    async fn stop(&self, app_id: AppId, processes: &[RoleProcess]) -> RuntimeResult<Option<i32>> {
        let _ = app_id;
        super::stop_processes(processes).await
    }

    async fn start_preview(&self, options: &PreviewOptions) -> RuntimeResult<PreviewHandle>;

    async fn stop_preview(&self, preview: &PreviewHandle) -> RuntimeResult<()> {
        if let Some(process) = &preview.process {
            process.terminate_and_wait().await?;
        }
        Ok(())
    }

    async fn package(
        &self,
        options: &PackageOptions,
        output: Option<OutputCallback>,
    ) -> RuntimeResult<PackageResult>;

    /// Validate and write one file.
    async fn apply_edit(&self, request: &EditRequest) -> RuntimeResult<EditOutcome> {
        edit::write_validated(&request.app_path, &request.file_path, &request.content).await
    }

    /// Drop any per-app state the provider keeps.
    async fn forget(&self, app_id: AppId) {
        let _ = app_id;
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn RuntimeProvider) {}
};
