//! Application state.

use sqlx::PgPool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use testmesh_core::ResourceId;
use testmesh_db::{PgExecutionStore, PgFlowRepo};
use testmesh_engine::{ActionDispatcher, BroadcastHub, CollectionRunner, FlowExecutor};
use testmesh_handlers::builtin_handlers;
use testmesh_plugins::PluginRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub flow_repo: Arc<PgFlowRepo>,
    pub execution_store: Arc<PgExecutionStore>,
    pub hub: Arc<BroadcastHub>,
    pub executor: Arc<FlowExecutor>,
    pub collection_runner: Arc<CollectionRunner>,
    pub plugins: Arc<PluginRegistry>,
    /// Cancellation tokens of in-flight executions, for the cancel route.
    pub running: Arc<RwLock<HashMap<ResourceId, CancellationToken>>>,
}

impl AppState {
    pub fn new(pool: PgPool, plugin_dir: &Path) -> Self {
        let flow_repo = Arc::new(PgFlowRepo::new(pool.clone()));
        let execution_store = Arc::new(PgExecutionStore::new(pool.clone()));
        let hub = Arc::new(BroadcastHub::new());
        let plugins = Arc::new(PluginRegistry::new(plugin_dir));

        let dispatcher =
            Arc::new(ActionDispatcher::new(builtin_handlers()).with_plugins(plugins.clone()));
        let executor = Arc::new(FlowExecutor::new(
            dispatcher,
            execution_store.clone(),
            hub.clone(),
        ));
        let collection_runner = Arc::new(CollectionRunner::new(
            executor.clone(),
            execution_store.clone(),
        ));

        Self {
            pool,
            flow_repo,
            execution_store,
            hub,
            executor,
            collection_runner,
            plugins,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Discover plugins on disk. Called once at startup; loading stays an
    /// explicit API action.
    pub async fn init_plugins(&self) {
        match self.plugins.discover().await {
            Ok(found) if !found.is_empty() => {
                tracing::info!(plugins = ?found, "Discovered plugins");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Plugin discovery failed"),
        }
    }

    pub fn track_execution(&self, id: ResourceId, cancel: CancellationToken) {
        self.running.write().unwrap().insert(id, cancel);
    }

    pub fn untrack_execution(&self, id: ResourceId) {
        self.running.write().unwrap().remove(&id);
    }

    /// Cancel an in-flight execution. Returns false when it is not running.
    pub fn cancel_execution(&self, id: ResourceId) -> bool {
        match self.running.read().unwrap().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
