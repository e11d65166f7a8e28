//! Flow validation command.

use anyhow::{Context, Result};
use std::path::Path;

/// Parse and validate a flow file without executing it.
pub fn validate(path: &Path) -> Result<()> {
    let flow = testmesh_config::load_flow_file(path)
        .with_context(|| format!("invalid flow {}", path.display()))?;

    println!("✓ {} is valid", path.display());
    println!("  name: {}", flow.name);
    println!(
        "  steps: {} setup, {} main, {} teardown",
        flow.setup.len(),
        flow.steps.len(),
        flow.teardown.len()
    );

    let actions: std::collections::BTreeSet<&str> = flow
        .setup
        .iter()
        .chain(&flow.steps)
        .chain(&flow.teardown)
        .map(|step| step.action.as_str())
        .collect();
    println!("  actions: {}", actions.into_iter().collect::<Vec<_>>().join(", "));
    Ok(())
}
