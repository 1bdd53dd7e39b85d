//! The operation surface exposed to the UI/IPC layer.
//!
//! [`Orchestrator`] wires the kernel, providers, registry, lifecycle
//! controller, log router, hot-reload manager and prerequisite cache
//! together. It holds no per-app state of its own.

use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::AppId;
use crate::cache::TtlCache;
use crate::catalog::RuntimeCatalog;
use crate::config::OrchestratorConfig;
use crate::edit::{self, EditOutcome, EditRequest, ReloadAction};
use crate::error::{RuntimeError, RuntimeResult};
use crate::hot_reload::{
    HotReloadManager, HotReloadOptions, HotReloadSession, SessionStatus, SupportCheck, WatchCommand,
};
use crate::kernel::ExecutionKernel;
use crate::lifecycle::{AppSnapshot, AppState, LifecycleController, Operation};
use crate::logs::{LogEvent, LogRole, LogRouter};
use crate::provider::dotnet::DotNetProvider;
use crate::provider::node::NodeProvider;
use crate::provider::tauri::TauriProvider;
use crate::provider::{
    BuildRequest, BuildResult, DependencyResult, PackageOptions, PackageResult, PrerequisiteReport,
    PreviewHandle, PreviewOptions, ProviderRegistry, ProviderSettings, RegistryError, RunRequest,
    RunResult, RuntimeDescriptor, RuntimeKind, RuntimeProvider, ScaffoldRequest, ScaffoldResult,
};

/// Answer to `get_hot_reload_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotReloadStatus {
    pub status: Option<SessionStatus>,
    pub session: Option<HotReloadSession>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    kernel: Arc<ExecutionKernel>,
    router: Arc<LogRouter>,
    registry: ProviderRegistry,
    catalog: RuntimeCatalog,
    lifecycle: LifecycleController,
    hot_reload: HotReloadManager,
    prerequisites: TtlCache<RuntimeKind, PrerequisiteReport>,
}

impl Orchestrator {
    /// Build the standard Node, .NET and Tauri providers from `config`.
    pub fn new(config: OrchestratorConfig) -> Result<Self, RegistryError> {
        let kernel = Arc::new(ExecutionKernel::new(config.kernel_config()));
        let settings = ProviderSettings::from(&config);
        let registry = ProviderRegistry::new(
            Arc::new(NodeProvider::new(kernel.clone(), settings.clone())),
            Arc::new(DotNetProvider::new(kernel.clone(), settings.clone())),
            Arc::new(TauriProvider::new(kernel.clone(), settings)),
        )?;
        Ok(Self::assemble(config, kernel, registry))
    }

    /// Use caller-supplied providers sharing `kernel`.
    pub fn with_registry(
        config: OrchestratorConfig,
        kernel: Arc<ExecutionKernel>,
        registry: ProviderRegistry,
    ) -> Self {
        Self::assemble(config, kernel, registry)
    }

    fn assemble(config: OrchestratorConfig, kernel: Arc<ExecutionKernel>, registry: ProviderRegistry) -> Self {
        let router = Arc::new(LogRouter::new(config.logs.sink_capacity));
        let hot_reload = HotReloadManager::new(
            kernel.clone(),
            router.clone(),
            WatchCommand::from(&config.hot_reload),
            config.build_timeout(),
        );
        let catalog = registry.catalog();
        info!(
            runtimes = catalog.list().len(),
            sink_capacity = config.logs.sink_capacity,
            "orchestrator ready"
        );
        Self {
            lifecycle: LifecycleController::new(router.clone()),
            prerequisites: TtlCache::new(config.prerequisite_cache_ttl()),
            catalog,
            hot_reload,
            registry,
            router,
            kernel,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Descriptor-only view, safe to hand to presentation code.
    pub fn catalog(&self) -> &RuntimeCatalog {
        &self.catalog
    }

    pub fn list_runtimes(&self) -> Vec<RuntimeDescriptor> {
        self.catalog.list().into_iter().cloned().collect()
    }

    fn provider_for(&self, stack_type: &str) -> RuntimeResult<(RuntimeKind, Arc<dyn RuntimeProvider>)> {
        let kind = self
            .registry
            .kind_for(stack_type)
            .map_err(|e| RuntimeError::NotFound(e.to_string()))?;
        Ok((kind, self.registry.provider(kind).clone()))
    }

    // -------------------------------------------------------------------
    // Prerequisites
    // -------------------------------------------------------------------

    /// Toolchain report for the runtime serving `stack_type`, cached per
    /// runtime for the configured TTL.
    pub async fn check_prerequisites(&self, stack_type: &str) -> RuntimeResult<PrerequisiteReport> {
        let (kind, provider) = self.provider_for(stack_type)?;
        if let Some(report) = self.prerequisites.get(&kind) {
            debug!(runtime = %kind, "prerequisites served from cache");
            return Ok(report);
        }
        let report = provider.check_prerequisites().await;
        info!(runtime = %kind, ready = report.ready, missing = ?report.missing, "checked prerequisites");
        self.prerequisites.insert(kind, report.clone());
        Ok(report)
    }

    /// Forget cached toolchain reports, e.g. after the user installs one.
    pub fn invalidate_prerequisites(&self) {
        self.prerequisites.invalidate_all();
    }

    async fn require_toolchain(&self, stack_type: &str) -> RuntimeResult<Arc<dyn RuntimeProvider>> {
        let report = self.check_prerequisites(stack_type).await?;
        if !report.ready {
            return Err(RuntimeError::PrerequisiteMissing {
                missing: report.missing,
            });
        }
        Ok(self.provider_for(stack_type)?.1)
    }

    // -------------------------------------------------------------------
    // Scaffold / resolve / build / run / stop
    // -------------------------------------------------------------------

    pub async fn scaffold_app(&self, request: &ScaffoldRequest) -> RuntimeResult<ScaffoldResult> {
        let provider = self.require_toolchain(&request.stack_type).await?;
        info!(
            project = %request.project_name,
            stack = %request.stack_type,
            target = %request.target_path.display(),
            "scaffolding app"
        );
        provider.scaffold(request).await
    }

    pub async fn resolve_dependencies(
        &self,
        app_id: AppId,
        app_path: &std::path::Path,
        stack_type: &str,
    ) -> RuntimeResult<DependencyResult> {
        let provider = self.require_toolchain(stack_type).await?;
        let _guard = self.lifecycle.acquire(app_id, Operation::Install)?;
        self.router.system(app_id, "resolving dependencies");
        let result = provider
            .resolve_dependencies(app_id, app_path, Some(self.router.system_tap(app_id)))
            .await?;
        match &result.error {
            Some(error) => self
                .router
                .system(app_id, format!("dependency resolution failed: {error}")),
            None => self.router.system(app_id, "dependencies resolved"),
        }
        Ok(result)
    }

    pub async fn build_app(&self, request: &BuildRequest) -> RuntimeResult<BuildResult> {
        let provider = self.require_toolchain(&request.stack_type).await?;
        self.lifecycle.build(provider, request).await
    }

    pub async fn run_app(&self, request: RunRequest) -> RuntimeResult<RunResult> {
        let provider = self.require_toolchain(&request.stack_type).await?;
        self.lifecycle.run(provider, request).await
    }

    /// Stop the app's processes. Returns the primary exit code, if any.
    pub async fn stop_app(&self, app_id: AppId) -> RuntimeResult<Option<i32>> {
        self.lifecycle.stop(app_id).await
    }

    pub fn app_state(&self, app_id: AppId) -> AppState {
        self.lifecycle.state(app_id)
    }

    pub fn is_ready(&self, app_id: AppId) -> bool {
        self.lifecycle.is_ready(app_id)
    }

    pub fn app_snapshot(&self, app_id: AppId) -> Option<AppSnapshot> {
        self.lifecycle.snapshot(app_id)
    }

    pub fn app_snapshots(&self) -> Vec<AppSnapshot> {
        self.lifecycle.snapshots()
    }

    // -------------------------------------------------------------------
    // Logs
    // -------------------------------------------------------------------

    pub fn get_logs(&self, app_id: AppId, role: LogRole) -> Vec<LogEvent> {
        self.router.logs(app_id, role)
    }

    pub fn get_logs_since(&self, app_id: AppId, role: LogRole, after: u64) -> Vec<LogEvent> {
        self.router.logs_since(app_id, role, after)
    }

    pub fn subscribe_logs(&self, app_id: AppId, role: LogRole) -> impl Stream<Item = LogEvent> + use<> {
        self.router.subscribe(app_id, role)
    }

    /// Backlog then live events.
    pub fn follow_logs(&self, app_id: AppId, role: LogRole) -> impl Stream<Item = LogEvent> + use<> {
        self.router.follow(app_id, role)
    }

    // -------------------------------------------------------------------
    // Edits and hot reload
    // -------------------------------------------------------------------

    /// Validate and write one file, then report how the running app will
    /// pick the change up.
    ///
    /// The provider is the one recorded by the app's last run; failing
    /// that, a request naming a project goes to the .NET provider, and
    /// anything else is written without provider bookkeeping.
    pub async fn apply_edit(&self, request: &EditRequest) -> RuntimeResult<EditOutcome> {
        let app_id = request.app_id;
        let _guard = self.lifecycle.acquire(app_id, Operation::Edit)?;

        let stack = self.lifecycle.snapshot(app_id).and_then(|s| s.stack_type);
        let provider = match stack {
            Some(stack) => Some(self.provider_for(&stack)?.1),
            None if request.project_name.is_some() => {
                Some(self.registry.provider(RuntimeKind::DotNet).clone())
            }
            None => None,
        };
        let mut outcome = match provider {
            Some(provider) => provider.apply_edit(request).await,
            None => edit::write_validated(&request.app_path, &request.file_path, &request.content).await,
        }
        .inspect_err(|e| warn!(app_id, file = %request.file_path, error = %e, "edit rejected"))?;

        outcome.reload = if self.hot_reload.is_active(app_id) {
            ReloadAction::HotReload
        } else if self.lifecycle.state(app_id) == AppState::Running {
            ReloadAction::RestartRequired
        } else {
            ReloadAction::None
        };
        info!(
            app_id,
            file = %request.file_path,
            created = outcome.created,
            magnitude = ?outcome.magnitude,
            reload = ?outcome.reload,
            "edit applied"
        );
        Ok(outcome)
    }

    pub fn check_hot_reload_support(&self, stack_type: &str) -> SupportCheck {
        self.hot_reload.check_support(stack_type)
    }

    /// Start a watcher session. When the app's stack is known from a
    /// previous run, it must support hot reload.
    pub async fn start_hot_reload(&self, options: HotReloadOptions) -> RuntimeResult<HotReloadSession> {
        if let Some(stack) = self.lifecycle.snapshot(options.app_id).and_then(|s| s.stack_type) {
            let support = self.hot_reload.check_support(&stack);
            if !support.supported {
                return Err(RuntimeError::Unsupported(
                    support
                        .message
                        .unwrap_or_else(|| format!("hot reload for {stack}")),
                ));
            }
        }
        self.hot_reload.start(options).await
    }

    pub async fn stop_hot_reload(&self, app_id: AppId) -> RuntimeResult<()> {
        self.hot_reload.stop(app_id).await
    }

    pub fn get_hot_reload_status(&self, app_id: AppId) -> HotReloadStatus {
        let session = self.hot_reload.status(app_id);
        HotReloadStatus {
            status: session.as_ref().map(|s| s.status),
            session,
        }
    }

    // -------------------------------------------------------------------
    // Preview and package
    // -------------------------------------------------------------------

    pub async fn start_preview(&self, options: PreviewOptions) -> RuntimeResult<PreviewHandle> {
        let (_, provider) = self.provider_for(&options.stack_type)?;
        self.lifecycle.start_preview(provider, options).await
    }

    pub async fn stop_preview(&self, app_id: AppId) -> RuntimeResult<()> {
        self.lifecycle.stop_preview(app_id).await
    }

    pub async fn package_app(&self, options: &PackageOptions) -> RuntimeResult<PackageResult> {
        let provider = self.require_toolchain(&options.stack_type).await?;
        let app_id = options.app_id;
        let _guard = self.lifecycle.acquire(app_id, Operation::Package)?;
        self.router.system(
            app_id,
            format!("packaging {} ({})", options.output_format, options.architecture.as_str()),
        );
        let result = provider
            .package(options, Some(self.router.system_tap(app_id)))
            .await?;
        match (&result.artifact_path, &result.error) {
            (Some(path), _) if result.success => self
                .router
                .system(app_id, format!("package written to {}", path.display())),
            (_, Some(error)) => self.router.system(app_id, format!("packaging failed: {error}")),
            _ => {}
        }
        Ok(result)
    }

    // -------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------

    /// Stop everything for an app and drop its state, logs and provider
    /// caches.
    pub async fn forget(&self, app_id: AppId) -> RuntimeResult<()> {
        self.hot_reload.forget(app_id).await?;
        self.lifecycle.forget(app_id).await?;
        for kind in RuntimeKind::ALL {
            self.registry.provider(kind).forget(app_id).await;
        }
        info!(app_id, "app forgotten");
        Ok(())
    }

    /// Stop every session and app, then kill anything still alive.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.hot_reload.shutdown().await;
        self.lifecycle.shutdown().await;
        self.kernel.terminate_all().await;
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("lifecycle", &self.lifecycle)
            .field("hot_reload", &self.hot_reload)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_providers_register_without_overlap() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let ids: Vec<String> = orchestrator
            .list_runtimes()
            .into_iter()
            .map(|d| d.runtime_id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(orchestrator.catalog().resolve("wpf").is_ok());
    }

    #[tokio::test]
    async fn unknown_stacks_are_not_found() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let err = orchestrator.check_prerequisites("cobol").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[test]
    fn status_of_an_unknown_app_is_empty() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
        let status = orchestrator.get_hot_reload_status(9);
        assert!(status.status.is_none());
        assert!(status.session.is_none());
        assert_eq!(orchestrator.app_state(9), AppState::Idle);
    }
}
