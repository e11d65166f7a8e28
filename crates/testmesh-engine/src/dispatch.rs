//! Action dispatch across built-in handlers and plugins.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use testmesh_core::handler::{ActionHandler, CallEnvelope, Output};
use testmesh_core::{Error, ResourceId, Result};
use testmesh_plugins::{PluginRegistry, ResolvedPlugin};

/// Resolves action names and invokes the matching handler.
///
/// Resolution priority:
/// 1. built-in handler table, exact match
/// 2. loaded plugin, exact match on plugin id
/// 3. loaded plugin by prefix (`kafka.produce` → plugin `kafka`), with the
///    full action name forwarded as `_action`
pub struct ActionDispatcher {
    builtins: HashMap<String, Arc<dyn ActionHandler>>,
    plugins: Option<Arc<PluginRegistry>>,
}

/// A handler selected for one step.
pub enum ResolvedAction {
    Builtin(Arc<dyn ActionHandler>),
    Plugin(ResolvedPlugin),
}

impl std::fmt::Debug for ResolvedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAction::Builtin(_) => f.write_str("ResolvedAction::Builtin(..)"),
            ResolvedAction::Plugin(_) => f.write_str("ResolvedAction::Plugin(..)"),
        }
    }
}

impl ActionDispatcher {
    /// Build a dispatcher over an explicit handler list. Deployments choose
    /// which built-ins they carry; an absent built-in falls through to
    /// plugin resolution.
    pub fn new(handlers: Vec<Arc<dyn ActionHandler>>) -> Self {
        let builtins = handlers
            .into_iter()
            .map(|handler| (handler.name().to_string(), handler))
            .collect();
        Self {
            builtins,
            plugins: None,
        }
    }

    pub fn with_plugins(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.plugins = Some(registry);
        self
    }

    /// Registered built-in action names, sorted.
    pub fn builtin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve an action name to a handler.
    pub async fn resolve(&self, action: &str) -> Result<ResolvedAction> {
        if let Some(handler) = self.builtins.get(action) {
            return Ok(ResolvedAction::Builtin(handler.clone()));
        }
        if let Some(registry) = &self.plugins {
            if let Some(resolved) = registry.resolve(action).await {
                return Ok(ResolvedAction::Plugin(resolved));
            }
        }
        Err(Error::UnknownAction(action.to_string()))
    }

    /// Resolve and invoke in one go.
    pub async fn execute(
        &self,
        action: &str,
        envelope: &CallEnvelope,
        config: &Value,
    ) -> Result<Output> {
        self.resolve(action).await?.execute(envelope, config).await
    }

    /// Let handlers holding per-execution resources release them.
    pub async fn notify_execution_end(&self, execution_id: ResourceId) {
        for handler in self.builtins.values() {
            handler.on_execution_end(execution_id).await;
        }
    }
}

impl ResolvedAction {
    pub async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        match self {
            ResolvedAction::Builtin(handler) => handler.execute(envelope, config).await,
            ResolvedAction::Plugin(plugin) => plugin.execute(envelope, config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticHandler {
        name: &'static str,
    }

    #[async_trait]
    impl ActionHandler for StaticHandler {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _envelope: &CallEnvelope, _config: &Value) -> Result<Output> {
            let mut output = Output::new();
            output.insert("handled_by".into(), json!(self.name));
            Ok(output)
        }
    }

    fn dispatcher_with(names: &[&'static str]) -> ActionDispatcher {
        ActionDispatcher::new(
            names
                .iter()
                .map(|name| Arc::new(StaticHandler { name }) as Arc<dyn ActionHandler>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_builtin_exact_match_wins() {
        let dispatcher = dispatcher_with(&["http_request", "kafka.produce"]);
        let envelope = CallEnvelope::new(ResourceId::new(), ResourceId::new(), "s1");

        let output = dispatcher
            .execute("kafka.produce", &envelope, &json!({}))
            .await
            .unwrap();
        assert_eq!(output["handled_by"], "kafka.produce");
    }

    #[tokio::test]
    async fn test_unknown_action_is_an_error() {
        let dispatcher = dispatcher_with(&["log"]);
        let err = dispatcher.resolve("does.not.exist").await.unwrap_err();
        assert!(matches!(err, Error::UnknownAction(name) if name == "does.not.exist"));
    }

    #[tokio::test]
    async fn test_builtin_names_sorted() {
        let dispatcher = dispatcher_with(&["log", "delay", "http_request"]);
        assert_eq!(dispatcher.builtin_names(), vec!["delay", "http_request", "log"]);
    }
}
