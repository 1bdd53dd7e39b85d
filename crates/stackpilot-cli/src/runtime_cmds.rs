//! Implementation of the runtime inspection commands: `runtimes`, `check`,
//! and `hot-reload-support`.

use anyhow::Result;

use stackpilot_core::Orchestrator;

/// Print every registered runtime with its stacks and preview strategy.
pub fn run_runtimes(orchestrator: &Orchestrator) -> Result<()> {
    let runtimes = orchestrator.list_runtimes();
    if runtimes.is_empty() {
        println!("No runtimes registered.");
        return Ok(());
    }

    println!("{:<10} {:<28} {:<16} STACKS", "ID", "NAME", "PREVIEW");
    println!("{}", "-".repeat(80));
    for runtime in &runtimes {
        let stacks: Vec<&str> = runtime
            .supported_stack_types
            .iter()
            .map(String::as_str)
            .collect();
        println!(
            "{:<10} {:<28} {:<16} {}",
            runtime.runtime_id,
            runtime.runtime_name,
            runtime.preview_strategy.to_string(),
            stacks.join(", "),
        );
    }
    Ok(())
}

/// Probe the toolchain behind `stack` and print the report as JSON.
///
/// Exits non-zero when something is missing.
pub async fn run_check(orchestrator: &Orchestrator, stack: &str) -> Result<()> {
    let report = orchestrator.check_prerequisites(stack).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ready {
        anyhow::bail!("missing prerequisites: {}", report.missing.join(", "));
    }
    Ok(())
}

pub fn run_hot_reload_support(orchestrator: &Orchestrator, stack: &str) -> Result<()> {
    let check = orchestrator.check_hot_reload_support(stack);
    println!("{}", serde_json::to_string_pretty(&check)?);
    Ok(())
}
