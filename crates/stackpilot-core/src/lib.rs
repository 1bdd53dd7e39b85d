//! Runtime orchestration for generated application projects.
//!
//! Takes a project on disk and scaffolds, resolves, builds, runs, previews
//! and packages it across three stack families (Node/web, .NET desktop,
//! Tauri), with every child process funnelled through a single sandboxed
//! [`kernel::ExecutionKernel`].
//!
//! ```text
//! Orchestrator
//!     |
//!     +--> ProviderRegistry --resolve(stack)--> Arc<dyn RuntimeProvider>
//!     |                                              |
//!     +--> LifecycleController (per-app state) ------+--> ExecutionKernel
//!     |          |                                         |
//!     |          +--> LogRouter <----- output lines -------+
//!     |
//!     +--> HotReloadManager --(dotnet watch)--> ExecutionKernel
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod edit;
pub mod error;
pub mod hot_reload;
pub mod kernel;
pub mod lifecycle;
pub mod logs;
pub mod orchestrator;
pub mod provider;
pub mod validator;

pub use catalog::RuntimeCatalog;
pub use config::OrchestratorConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use orchestrator::Orchestrator;

/// Identifier of a generated application.
pub type AppId = u64;
