//! Action handler contract.
//!
//! Every protocol a step can exercise — built-in or out-of-process plugin —
//! implements [`ActionHandler`]: `(envelope, config) -> output | failure`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::{Error, ResourceId, Result};

/// The result mapping an action produces.
pub type Output = Map<String, Value>;

/// Ambient call context handed to every handler invocation.
///
/// Handlers must not mutate the envelope and must not retain references to
/// the config after returning; each call is independent aside from pooled
/// resources internal to the handler.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    pub execution_id: ResourceId,
    pub flow_id: ResourceId,
    pub step_id: String,
    /// Scalar context variables at the time of the call.
    pub variables: HashMap<String, String>,
    /// Snapshot of prior step outputs (forwarded to plugins).
    pub step_outputs: HashMap<String, Map<String, Value>>,
    /// Cancellation signal for the surrounding execution; handlers doing
    /// long-running work should return promptly once it fires.
    pub cancel: CancellationToken,
}

impl CallEnvelope {
    pub fn new(execution_id: ResourceId, flow_id: ResourceId, step_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            flow_id,
            step_id: step_id.into(),
            variables: HashMap::new(),
            step_outputs: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_step_outputs(mut self, outputs: HashMap<String, Map<String, Value>>) -> Self {
        self.step_outputs = outputs;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Trait for action handlers.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Action name this handler is registered under.
    fn name(&self) -> &str;

    /// Run the action against an interpolated config.
    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output>;

    /// Called once when an execution finishes, for handlers that hold
    /// per-execution resources (e.g. websocket connections).
    async fn on_execution_end(&self, _execution_id: ResourceId) {}
}

/// Typed view over an action config.
///
/// Step configs are dynamic JSON mappings; handlers describe the shape they
/// expect through this view and get explicit coercion errors instead of
/// panics or silent defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConfigView<'a> {
    config: &'a Value,
}

impl<'a> ConfigView<'a> {
    pub fn new(config: &'a Value) -> Self {
        Self { config }
    }

    /// Raw value for a key, if present.
    pub fn value(&self, key: &str) -> Option<&'a Value> {
        self.config.get(key).filter(|v| !v.is_null())
    }

    /// Raw value for a key; missing is a config error.
    pub fn require_value(&self, key: &str) -> Result<&'a Value> {
        self.value(key)
            .ok_or_else(|| Error::InvalidConfig(format!("missing required field `{key}`")))
    }

    pub fn str_opt(&self, key: &str) -> Result<Option<&'a str>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.type_error(key, "a string", other)),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&'a str> {
        self.str_opt(key)?
            .ok_or_else(|| Error::InvalidConfig(format!("missing required field `{key}`")))
    }

    pub fn u64_opt(&self, key: &str) -> Result<Option<u64>> {
        match self.value(key) {
            None => Ok(None),
            Some(value @ Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.type_error(key, "a non-negative integer", value)),
            Some(other) => Err(self.type_error(key, "a non-negative integer", other)),
        }
    }

    pub fn bool_opt(&self, key: &str) -> Result<Option<bool>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.type_error(key, "a boolean", other)),
        }
    }

    pub fn object_opt(&self, key: &str) -> Result<Option<&'a Map<String, Value>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(self.type_error(key, "an object", other)),
        }
    }

    pub fn array_opt(&self, key: &str) -> Result<Option<&'a Vec<Value>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Array(items)) => Ok(Some(items)),
            Some(other) => Err(self.type_error(key, "an array", other)),
        }
    }

    /// String form of a scalar field (strings verbatim, numbers and booleans
    /// rendered), for fields like message keys that accept either.
    pub fn scalar_string_opt(&self, key: &str) -> Result<Option<String>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(self.type_error(key, "a scalar", other)),
        }
    }

    fn type_error(&self, key: &str, expected: &str, got: &Value) -> Error {
        let kind = match got {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
            Value::Object(_) => "an object",
        };
        Error::InvalidConfig(format!("field `{key}` must be {expected}, got {kind}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_str() {
        let config = json!({ "url": "http://api.test", "count": 3 });
        let view = ConfigView::new(&config);

        assert_eq!(view.require_str("url").unwrap(), "http://api.test");
        assert!(matches!(
            view.require_str("missing"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            view.require_str("count"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_optional_accessors_distinguish_absent_from_mistyped() {
        let config = json!({ "timeout": "5s", "count": 3, "verbose": true });
        let view = ConfigView::new(&config);

        assert_eq!(view.u64_opt("count").unwrap(), Some(3));
        assert_eq!(view.u64_opt("absent").unwrap(), None);
        assert!(view.u64_opt("timeout").is_err());

        assert_eq!(view.bool_opt("verbose").unwrap(), Some(true));
        assert!(view.bool_opt("count").is_err());
    }

    #[test]
    fn test_null_counts_as_absent() {
        let config = json!({ "key": null });
        let view = ConfigView::new(&config);
        assert_eq!(view.str_opt("key").unwrap(), None);
    }

    #[test]
    fn test_scalar_string_renders_numbers() {
        let config = json!({ "key": 42, "flag": false, "name": "abc" });
        let view = ConfigView::new(&config);
        assert_eq!(view.scalar_string_opt("key").unwrap().unwrap(), "42");
        assert_eq!(view.scalar_string_opt("flag").unwrap().unwrap(), "false");
        assert_eq!(view.scalar_string_opt("name").unwrap().unwrap(), "abc");
    }
}
