//! `log` handler.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

/// Emits a message through the structured logger.
///
/// Config: `{ message, level? }` with `level` one of
/// `debug|info|warn|error` (default `info`).
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let message = view.require_str("message")?;
        let level = view.str_opt("level")?.unwrap_or("info");

        match level {
            "debug" => debug!(execution_id = %envelope.execution_id, step = %envelope.step_id, "{message}"),
            "info" => info!(execution_id = %envelope.execution_id, step = %envelope.step_id, "{message}"),
            "warn" => warn!(execution_id = %envelope.execution_id, step = %envelope.step_id, "{message}"),
            "error" => error!(execution_id = %envelope.execution_id, step = %envelope.step_id, "{message}"),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "invalid log level `{other}`; expected debug, info, warn or error"
                )));
            }
        }

        let mut output = Output::new();
        output.insert("message".into(), json!(message));
        output.insert("level".into(), json!(level));
        output.insert("logged".into(), json!(true));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmesh_core::ResourceId;

    fn envelope() -> CallEnvelope {
        CallEnvelope::new(ResourceId::new(), ResourceId::new(), "log-step")
    }

    #[tokio::test]
    async fn test_logs_with_default_level() {
        let handler = LogHandler;
        let output = handler
            .execute(&envelope(), &json!({ "message": "hello" }))
            .await
            .unwrap();
        assert_eq!(output["message"], "hello");
        assert_eq!(output["level"], "info");
        assert_eq!(output["logged"], true);
    }

    #[tokio::test]
    async fn test_rejects_unknown_level() {
        let handler = LogHandler;
        let err = handler
            .execute(&envelope(), &json!({ "message": "m", "level": "loud" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_requires_message() {
        let handler = LogHandler;
        let err = handler
            .execute(&envelope(), &json!({ "level": "info" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
