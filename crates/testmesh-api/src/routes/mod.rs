//! API routes.

pub mod collections;
pub mod executions;
pub mod flows;
pub mod health;
pub mod plugins;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/flows", flows::router())
        .nest("/executions", executions::router())
        .nest("/collections", collections::router())
        .nest("/plugins", plugins::router())
}
