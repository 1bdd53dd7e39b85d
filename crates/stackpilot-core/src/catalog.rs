//! Read-only runtime metadata for presentation code.
//!
//! A [`RuntimeCatalog`] holds descriptors and nothing else: no provider,
//! no kernel, nothing that can start a process. It is what gets handed to
//! code that only needs to know how an app will be previewed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::provider::{PreviewStrategy, RegistryError, RuntimeDescriptor, RuntimeKind};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeCatalog {
    runtimes: BTreeMap<RuntimeKind, RuntimeDescriptor>,
}

impl RuntimeCatalog {
    pub fn new(descriptors: impl IntoIterator<Item = (RuntimeKind, RuntimeDescriptor)>) -> Self {
        Self {
            runtimes: descriptors.into_iter().collect(),
        }
    }

    pub fn list(&self) -> Vec<&RuntimeDescriptor> {
        self.runtimes.values().collect()
    }

    pub fn descriptor(&self, runtime_id: &str) -> Option<&RuntimeDescriptor> {
        self.runtimes.values().find(|d| d.runtime_id == runtime_id)
    }

    /// Descriptor of the runtime that supports `stack_type`.
    pub fn resolve(&self, stack_type: &str) -> Result<&RuntimeDescriptor, RegistryError> {
        self.runtimes
            .values()
            .find(|d| d.supports(stack_type))
            .ok_or_else(|| RegistryError::UnknownStack(stack_type.to_owned()))
    }

    pub fn preview_strategy(&self, stack_type: &str) -> Option<PreviewStrategy> {
        self.resolve(stack_type).ok().map(|d| d.preview_strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> RuntimeCatalog {
        RuntimeCatalog::new([
            (
                RuntimeKind::Node,
                RuntimeDescriptor::new("node", "Node.js", PreviewStrategy::Iframe, &["react", "vue"]),
            ),
            (
                RuntimeKind::DotNet,
                RuntimeDescriptor::new("dotnet", ".NET", PreviewStrategy::ExternalWindow, &["wpf"]),
            ),
        ])
    }

    #[test]
    fn resolves_preview_strategy_by_stack() {
        let catalog = catalog();
        assert_eq!(catalog.preview_strategy("vue"), Some(PreviewStrategy::Iframe));
        assert_eq!(catalog.preview_strategy("wpf"), Some(PreviewStrategy::ExternalWindow));
        assert_eq!(catalog.preview_strategy("cobol"), None);
    }

    #[test]
    fn looks_up_by_runtime_id() {
        let catalog = catalog();
        assert_eq!(catalog.descriptor("dotnet").unwrap().runtime_name, ".NET");
        assert!(catalog.descriptor("tauri").is_none());
        assert_eq!(catalog.list().len(), 2);
    }
}
