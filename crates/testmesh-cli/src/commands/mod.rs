//! CLI commands.

pub mod collection;
pub mod run;
pub mod validate;

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use testmesh_db::MemoryExecutionStore;
use testmesh_engine::{ActionDispatcher, BroadcastHub, FlowExecutor};
use testmesh_handlers::builtin_handlers;
use testmesh_plugins::PluginRegistry;

/// Parse `--var key=value` pairs.
pub fn parse_vars(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut variables = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --var `{pair}`, expected KEY=VALUE");
        };
        variables.insert(key.to_string(), value.to_string());
    }
    Ok(variables)
}

/// Local execution stack: in-memory store, built-in handlers, and any
/// plugins discovered in the plugin directory (loaded eagerly so their
/// actions resolve).
pub async fn local_stack(
    plugin_dir: Option<&Path>,
) -> Result<(Arc<FlowExecutor>, Arc<MemoryExecutionStore>, Arc<BroadcastHub>)> {
    let store = Arc::new(MemoryExecutionStore::new());
    let hub = Arc::new(BroadcastHub::new());

    let mut dispatcher = ActionDispatcher::new(builtin_handlers());
    if let Some(dir) = plugin_dir {
        let registry = Arc::new(PluginRegistry::new(dir));
        let discovered = registry
            .discover()
            .await
            .with_context(|| format!("failed to scan plugin directory {}", dir.display()))?;
        for id in &discovered {
            if let Err(e) = registry.load(id).await {
                eprintln!("warning: failed to load plugin {id}: {e}");
            }
        }
        dispatcher = dispatcher.with_plugins(registry);
    }

    let executor = Arc::new(FlowExecutor::new(
        Arc::new(dispatcher),
        store.clone(),
        hub.clone(),
    ));
    Ok((executor, store, hub))
}
