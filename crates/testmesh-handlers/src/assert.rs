//! `assert` handler.

use async_trait::async_trait;
use serde_json::{Value, json};

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};
use testmesh_engine::assertions;

/// Evaluates assertion expressions against arbitrary data mid-flow.
///
/// Config: `{ data, assertions: [string] }`. Succeeds with
/// `{ assertions_count, passed, data }` or fails with the first assertion's
/// detail.
pub struct AssertHandler;

#[async_trait]
impl ActionHandler for AssertHandler {
    fn name(&self) -> &str {
        "assert"
    }

    async fn execute(&self, _envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let data = view.require_value("data")?;
        let expressions = view
            .array_opt("assertions")?
            .ok_or_else(|| Error::InvalidConfig("missing required field `assertions`".into()))?;

        let data_object = data.as_object().ok_or_else(|| {
            Error::InvalidConfig("field `data` must be an object to assert against".into())
        })?;

        let expressions: Vec<String> = expressions
            .iter()
            .map(|e| {
                e.as_str().map(String::from).ok_or_else(|| {
                    Error::InvalidConfig(format!("assertions must be strings, got {e}"))
                })
            })
            .collect::<Result<_>>()?;

        assertions::evaluate_all(data_object, &expressions)?;

        let mut output = Output::new();
        output.insert("assertions_count".into(), json!(expressions.len()));
        output.insert("passed".into(), json!(true));
        output.insert("data".into(), data.clone());
        Ok(output)
    }
}
