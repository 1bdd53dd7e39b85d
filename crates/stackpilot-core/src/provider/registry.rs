//! Stack type → provider resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::RuntimeProvider;
use super::types::RuntimeDescriptor;
use crate::catalog::RuntimeCatalog;

/// The closed set of provider variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Node,
    DotNet,
    Tauri,
}

impl RuntimeKind {
    pub const ALL: [Self; 3] = [Self::Node, Self::DotNet, Self::Tauri];
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::DotNet => "dotnet",
            Self::Tauri => "tauri",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stack type {stack:?} is claimed by both {first} and {second}")]
    OverlappingStack {
        stack: String,
        first: RuntimeKind,
        second: RuntimeKind,
    },
    #[error("provider registered as {expected} reports itself as {actual}")]
    KindMismatch {
        expected: RuntimeKind,
        actual: RuntimeKind,
    },
    #[error("no runtime supports stack type {0:?}")]
    UnknownStack(String),
}

/// Exactly one provider per [`RuntimeKind`].
///
/// Stack claims are checked for overlap at construction, so resolution
/// is a map lookup followed by a match on the kind.
pub struct ProviderRegistry {
    node: Arc<dyn RuntimeProvider>,
    dotnet: Arc<dyn RuntimeProvider>,
    tauri: Arc<dyn RuntimeProvider>,
    stacks: HashMap<String, RuntimeKind>,
}

impl ProviderRegistry {
    pub fn new(
        node: Arc<dyn RuntimeProvider>,
        dotnet: Arc<dyn RuntimeProvider>,
        tauri: Arc<dyn RuntimeProvider>,
    ) -> Result<Self, RegistryError> {
        let mut stacks = HashMap::new();
        for (expected, provider) in [
            (RuntimeKind::Node, &node),
            (RuntimeKind::DotNet, &dotnet),
            (RuntimeKind::Tauri, &tauri),
        ] {
            if provider.kind() != expected {
                return Err(RegistryError::KindMismatch {
                    expected,
                    actual: provider.kind(),
                });
            }
            for stack in &provider.descriptor().supported_stack_types {
                let key = stack.to_ascii_lowercase();
                if let Some(first) = stacks.insert(key.clone(), expected) {
                    return Err(RegistryError::OverlappingStack {
                        stack: key,
                        first,
                        second: expected,
                    });
                }
            }
        }
        Ok(Self {
            node,
            dotnet,
            tauri,
            stacks,
        })
    }

    pub fn kind_for(&self, stack_type: &str) -> Result<RuntimeKind, RegistryError> {
        self.stacks
            .get(&stack_type.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| RegistryError::UnknownStack(stack_type.to_owned()))
    }

    pub fn provider(&self, kind: RuntimeKind) -> &Arc<dyn RuntimeProvider> {
        match kind {
            RuntimeKind::Node => &self.node,
            RuntimeKind::DotNet => &self.dotnet,
            RuntimeKind::Tauri => &self.tauri,
        }
    }

    pub fn resolve(&self, stack_type: &str) -> Result<&Arc<dyn RuntimeProvider>, RegistryError> {
        self.kind_for(stack_type).map(|kind| self.provider(kind))
    }

    pub fn descriptors(&self) -> Vec<RuntimeDescriptor> {
        RuntimeKind::ALL
            .iter()
            .map(|kind| self.provider(*kind).descriptor().clone())
            .collect()
    }

    /// The descriptor-only view handed to unprivileged callers.
    pub fn catalog(&self) -> RuntimeCatalog {
        RuntimeCatalog::new(
            RuntimeKind::ALL
                .iter()
                .map(|kind| (*kind, self.provider(*kind).descriptor().clone())),
        )
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("stacks", &self.stacks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::kernel::ExecutionKernel;
    use crate::provider::{ProviderSettings, dotnet::DotNetProvider, node::NodeProvider, tauri::TauriProvider};

    fn registry() -> ProviderRegistry {
        let config = OrchestratorConfig::default();
        let kernel = Arc::new(ExecutionKernel::new(config.kernel_config()));
        let settings = ProviderSettings::from(&config);
        ProviderRegistry::new(
            Arc::new(NodeProvider::new(kernel.clone(), settings.clone())),
            Arc::new(DotNetProvider::new(kernel.clone(), settings.clone())),
            Arc::new(TauriProvider::new(kernel, settings)),
        )
        .unwrap()
    }

    #[test]
    fn builtin_providers_claim_disjoint_stacks() {
        let registry = registry();
        assert_eq!(registry.kind_for("react").unwrap(), RuntimeKind::Node);
        assert_eq!(registry.kind_for("WPF").unwrap(), RuntimeKind::DotNet);
        assert_eq!(registry.kind_for("tauri").unwrap(), RuntimeKind::Tauri);
        assert_eq!(registry.kind_for("tauri-vue").unwrap(), RuntimeKind::Tauri);
        assert_eq!(
            registry.kind_for("cobol").unwrap_err(),
            RegistryError::UnknownStack("cobol".into())
        );
    }

    #[test]
    fn resolve_returns_matching_provider() {
        let registry = registry();
        let provider = registry.resolve("winforms").unwrap();
        assert_eq!(provider.kind(), RuntimeKind::DotNet);
        assert_eq!(provider.descriptor().runtime_id, "dotnet");
    }

    #[test]
    fn swapped_providers_are_rejected() {
        let config = OrchestratorConfig::default();
        let kernel = Arc::new(ExecutionKernel::new(config.kernel_config()));
        let settings = ProviderSettings::from(&config);
        let node: Arc<dyn RuntimeProvider> = Arc::new(NodeProvider::new(kernel.clone(), settings.clone()));
        let dotnet: Arc<dyn RuntimeProvider> = Arc::new(DotNetProvider::new(kernel, settings));
        let err = ProviderRegistry::new(dotnet, node.clone(), node).unwrap_err();
        assert_eq!(
            err,
            RegistryError::KindMismatch {
                expected: RuntimeKind::Node,
                actual: RuntimeKind::DotNet,
            }
        );
    }
}
