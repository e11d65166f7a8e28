//! `delay` handler.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Instant;

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

/// Pauses the flow for a configured duration.
///
/// Config: `{ duration }` as a duration string (`100ms`, `2s`, `1m`).
/// Cancellable: the sleep aborts promptly when the execution is cancelled.
pub struct DelayHandler;

#[async_trait]
impl ActionHandler for DelayHandler {
    fn name(&self) -> &str {
        "delay"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let text = view.require_str("duration")?;
        let duration = humantime::parse_duration(text)
            .map_err(|e| Error::InvalidConfig(format!("invalid duration `{text}`: {e}")))?;

        let started = Instant::now();
        tokio::select! {
            _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => {}
        }

        let mut output = Output::new();
        output.insert("duration".into(), json!(text));
        output.insert("duration_ms".into(), json!(started.elapsed().as_millis() as u64));
        output.insert("completed".into(), json!(true));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use testmesh_core::ResourceId;
    use tokio_util::sync::CancellationToken;

    fn envelope() -> CallEnvelope {
        CallEnvelope::new(ResourceId::new(), ResourceId::new(), "delay-step")
    }

    #[tokio::test]
    async fn test_delay_waits_roughly_the_configured_time() {
        let handler = DelayHandler;
        let started = Instant::now();
        let output = handler
            .execute(&envelope(), &json!({ "duration": "50ms" }))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(output["completed"], true);
        assert_eq!(output["duration"], "50ms");
        assert!(output["duration_ms"].as_u64().unwrap() >= 50);
    }

    #[tokio::test]
    async fn test_delay_is_cancellable() {
        let handler = DelayHandler;
        let cancel = CancellationToken::new();
        let envelope = envelope().with_cancel(cancel.clone());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = handler
            .execute(&envelope, &json!({ "duration": "60s" }))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_malformed_duration_is_a_config_error() {
        let handler = DelayHandler;
        let err = handler
            .execute(&envelope(), &json!({ "duration": "soon" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
