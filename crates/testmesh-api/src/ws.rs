//! WebSocket handling for real-time execution events.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{info, warn};

use testmesh_core::ResourceId;
use testmesh_core::event::ExecutionEvent;
use testmesh_engine::BroadcastHub;

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    info!("WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    // Forwarder tasks per subscribed execution push into one outbox.
    let (outbox, mut outbox_rx) = mpsc::channel::<ExecutionEvent>(64);
    let mut forwarders: HashMap<ResourceId, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            // Client commands.
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(command) = serde_json::from_str::<WsCommand>(&text) {
                            match command {
                                WsCommand::Subscribe { execution_id } => {
                                    info!(execution_id = %execution_id, "Client subscribed");
                                    let rx = hub.subscribe(execution_id);
                                    let handle = tokio::spawn(forward_events(rx, outbox.clone()));
                                    if let Some(previous) = forwarders.insert(execution_id, handle) {
                                        previous.abort();
                                    }
                                    let response = WsResponse::Subscribed { execution_id };
                                    if let Ok(json) = serde_json::to_string(&response) {
                                        let _ = sender.send(Message::Text(json.into())).await;
                                    }
                                }
                                WsCommand::Unsubscribe { execution_id } => {
                                    info!(execution_id = %execution_id, "Client unsubscribed");
                                    if let Some(handle) = forwarders.remove(&execution_id) {
                                        handle.abort();
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }

            // Hub events for subscribed executions.
            event = outbox_rx.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    for (_, handle) in forwarders {
        handle.abort();
    }
}

/// Pump one execution topic into the socket outbox until the topic closes.
async fn forward_events(
    mut rx: broadcast::Receiver<ExecutionEvent>,
    outbox: mpsc::Sender<ExecutionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                // The outbox applies backpressure per socket; a stalled
                // socket eventually lags its broadcast receiver instead of
                // stalling the executor.
                if outbox.send(event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "WebSocket client lagging, dropped events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Subscribe { execution_id: ResourceId },
    Unsubscribe { execution_id: ResourceId },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsResponse {
    Subscribed { execution_id: ResourceId },
}
