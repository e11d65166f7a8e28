//! `transform` handler.

use async_trait::async_trait;
use serde_json::Value;

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};
use testmesh_engine::extract;

/// Reshapes a value into a new mapping.
///
/// Config: `{ input, transforms }` where each transform value starting with
/// `$` is a JSONPath applied to `input` (unmatched paths yield null) and
/// anything else is kept literally.
pub struct TransformHandler;

#[async_trait]
impl ActionHandler for TransformHandler {
    fn name(&self) -> &str {
        "transform"
    }

    async fn execute(&self, _envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let input = view.require_value("input")?;
        let transforms = view
            .object_opt("transforms")?
            .ok_or_else(|| Error::InvalidConfig("missing required field `transforms`".into()))?;

        let mut output = Output::new();
        for (key, rule) in transforms {
            let value = match rule {
                Value::String(path) if path.starts_with('$') => {
                    extract::evaluate_json_path(input, path)
                }
                literal => literal.clone(),
            };
            output.insert(key.clone(), value);
        }
        Ok(output)
    }
}
