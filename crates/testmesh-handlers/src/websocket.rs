//! `websocket` handler.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, ResourceId, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stateful websocket operations across the steps of one execution.
///
/// Config: `{ operation: connect|send|receive|close, connection_id?, url?,
/// message?, timeout? }`. Connections are keyed by
/// `(execution_id, connection_id)` so executions can never observe each
/// other's sockets, and anything left open is force-closed when the
/// execution finishes.
pub struct WebsocketHandler {
    connections: Mutex<HashMap<(ResourceId, String), WsStream>>,
}

impl WebsocketHandler {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Take a connection out of the registry for exclusive use.
    async fn take(&self, key: &(ResourceId, String)) -> Result<WsStream> {
        self.connections.lock().await.remove(key).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no open websocket connection `{}`; run a connect operation first",
                key.1
            ))
        })
    }

    async fn put_back(&self, key: (ResourceId, String), stream: WsStream) {
        self.connections.lock().await.insert(key, stream);
    }
}

impl Default for WebsocketHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for WebsocketHandler {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let operation = view.require_str("operation")?;
        let connection_id = view.str_opt("connection_id")?.unwrap_or("default").to_string();
        let key = (envelope.execution_id, connection_id.clone());

        let started = Instant::now();
        let mut output = Output::new();
        output.insert(
            "metadata".into(),
            json!({ "connection_id": connection_id, "operation": operation }),
        );

        match operation {
            "connect" => {
                let url = view.require_str("url")?;
                let connect = connect_async(url);
                let (stream, _response) = tokio::select! {
                    _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
                    connected = connect => connected
                        .map_err(|e| Error::Handler(format!("websocket connect to {url} failed: {e}")))?,
                };
                self.put_back(key, stream).await;
                output.insert("connected".into(), json!(true));
            }
            "send" => {
                let message = view.require_value("message")?;
                let text = match message {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };

                let mut stream = self.take(&key).await?;
                let sent = stream.send(Message::Text(text)).await;
                match sent {
                    Ok(()) => {
                        self.put_back(key, stream).await;
                        output.insert("connected".into(), json!(true));
                        output.insert("sent".into(), json!(true));
                    }
                    Err(e) => {
                        // A failed socket is not returned to the registry.
                        return Err(Error::Handler(format!("websocket send failed: {e}")));
                    }
                }
            }
            "receive" => {
                let timeout = match view.str_opt("timeout")? {
                    Some(text) => humantime::parse_duration(text).map_err(|e| {
                        Error::InvalidConfig(format!("invalid timeout `{text}`: {e}"))
                    })?,
                    None => DEFAULT_RECEIVE_TIMEOUT,
                };

                let mut stream = self.take(&key).await?;
                let received = tokio::select! {
                    _ = envelope.cancel.cancelled() => {
                        self.put_back(key, stream).await;
                        return Err(Error::Cancelled);
                    }
                    received = tokio::time::timeout(timeout, next_data_message(&mut stream)) => received,
                };

                match received {
                    Err(_) => {
                        self.put_back(key, stream).await;
                        return Err(Error::Handler(format!(
                            "no websocket message within {}",
                            humantime::format_duration(timeout)
                        )));
                    }
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok((value, message_type))) => {
                        self.put_back(key, stream).await;
                        output.insert("connected".into(), json!(true));
                        output.insert("received_message".into(), value);
                        output.insert("message_type".into(), json!(message_type));
                    }
                }
            }
            "close" => {
                let mut stream = self.take(&key).await?;
                if let Err(e) = stream.close(None).await {
                    debug!(connection = %connection_id, error = %e, "Websocket close error");
                }
                output.insert("connected".into(), json!(false));
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown websocket operation `{other}`; expected connect, send, receive or close"
                )));
            }
        }

        output.insert(
            "latency_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );
        Ok(output)
    }

    /// Force-close any connection the execution left open.
    async fn on_execution_end(&self, execution_id: ResourceId) {
        let mut connections = self.connections.lock().await;
        let keys: Vec<_> = connections
            .keys()
            .filter(|(owner, _)| *owner == execution_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut stream) = connections.remove(&key) {
                warn!(connection = %key.1, execution_id = %execution_id, "Closing leaked websocket connection");
                let _ = stream.close(None).await;
            }
        }
    }
}

/// Read frames until a text or binary message arrives, answering pings
/// along the way.
async fn next_data_message(stream: &mut WsStream) -> Result<(Value, &'static str)> {
    loop {
        match stream.next().await {
            None => return Err(Error::Handler("websocket closed by peer".into())),
            Some(Err(e)) => return Err(Error::Handler(format!("websocket receive failed: {e}"))),
            Some(Ok(Message::Text(text))) => {
                let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
                return Ok((value, "text"));
            }
            Some(Ok(Message::Binary(bytes))) => {
                return Ok((
                    Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                    "binary",
                ));
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = stream.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) => {
                return Err(Error::Handler("websocket closed by peer".into()));
            }
            Some(Ok(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmesh_core::ResourceId;

    fn envelope() -> CallEnvelope {
        CallEnvelope::new(ResourceId::new(), ResourceId::new(), "ws-step")
    }

    #[tokio::test]
    async fn test_send_without_connect_is_a_config_error() {
        let handler = WebsocketHandler::new();
        let config = json!({ "operation": "send", "message": "hi" });
        let err = handler.execute(&envelope(), &config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let handler = WebsocketHandler::new();
        let config = json!({ "operation": "subscribe" });
        let err = handler.execute(&envelope(), &config).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let handler = WebsocketHandler::new();
        let config = json!({ "operation": "connect", "url": "ws://127.0.0.1:9/ws" });
        let err = handler.execute(&envelope(), &config).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connections_are_scoped_per_execution() {
        let handler = WebsocketHandler::new();
        // Same connection_id under two executions resolves independently:
        // neither sees the other's (absent) connection.
        let first = envelope();
        let second = envelope();
        let config = json!({ "operation": "close", "connection_id": "shared" });

        assert!(handler.execute(&first, &config).await.is_err());
        assert!(handler.execute(&second, &config).await.is_err());
    }
}
