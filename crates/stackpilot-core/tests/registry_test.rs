//! Stack resolution across the real providers, and the descriptor-only
//! catalog handed to presentation code.

use std::sync::Arc;

use stackpilot_core::OrchestratorConfig;
use stackpilot_core::kernel::ExecutionKernel;
use stackpilot_core::orchestrator::Orchestrator;
use stackpilot_core::provider::dotnet::DotNetProvider;
use stackpilot_core::provider::node::NodeProvider;
use stackpilot_core::provider::tauri::TauriProvider;
use stackpilot_core::provider::{
    PreviewStrategy, ProviderRegistry, ProviderSettings, RegistryError, RuntimeKind,
};
use stackpilot_test_utils::{ScriptedProvider, test_kernel};

fn real_registry() -> ProviderRegistry {
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
fn every_claimed_stack_resolves_to_its_claimant() {
    let registry = real_registry();
    for kind in RuntimeKind::ALL {
        let provider = registry.provider(kind);
        for stack in &provider.descriptor().supported_stack_types {
            let resolved = registry.resolve(stack).unwrap();
            assert_eq!(resolved.kind(), kind, "stack {stack}");
        }
    }
}

#[test]
fn resolution_ignores_case_and_rejects_unknown_stacks() {
    let registry = real_registry();
    assert_eq!(registry.kind_for("WPF").unwrap(), RuntimeKind::DotNet);
    assert_eq!(registry.kind_for("Tauri").unwrap(), RuntimeKind::Tauri);
    assert_eq!(
        registry.kind_for("fortran"),
        Err(RegistryError::UnknownStack("fortran".into()))
    );
}

#[test]
fn overlapping_claims_fail_at_construction() {
    let kernel = test_kernel();
    let result = ProviderRegistry::new(
        Arc::new(ScriptedProvider::new(RuntimeKind::Node, &["react", "shared"], kernel.clone())),
        Arc::new(ScriptedProvider::new(RuntimeKind::DotNet, &["wpf", "shared"], kernel.clone())),
        Arc::new(ScriptedProvider::new(RuntimeKind::Tauri, &["tauri"], kernel)),
    );
    match result {
        Err(RegistryError::OverlappingStack { stack, first, second }) => {
            assert_eq!(stack, "shared");
            assert_eq!(first, RuntimeKind::Node);
            assert_eq!(second, RuntimeKind::DotNet);
        }
        other => panic!("expected an overlap error, got {other:?}"),
    }
}

#[test]
fn catalog_exposes_preview_strategies_only() {
    let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
    let catalog = orchestrator.catalog().clone();

    assert_eq!(catalog.preview_strategy("react"), Some(PreviewStrategy::Iframe));
    assert_eq!(catalog.preview_strategy("wpf"), Some(PreviewStrategy::ExternalWindow));
    assert_eq!(catalog.preview_strategy("tauri"), Some(PreviewStrategy::Hybrid));
    assert_eq!(catalog.preview_strategy("cobol"), None);

    let json = serde_json::to_value(&catalog).unwrap();
    assert!(json.to_string().contains("external-window"));
}
