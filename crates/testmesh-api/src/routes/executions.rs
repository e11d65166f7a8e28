//! Execution inspection and cancellation endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use testmesh_core::ResourceId;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_execution))
        .route("/{id}/steps", get(get_steps))
        .route("/{id}/cancel", post(cancel_execution))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .execution_store
        .get_execution(ResourceId::from_uuid(id))
        .await?;
    Ok(Json(json!(record.to_execution()?)))
}

async fn get_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let records = state
        .execution_store
        .list_steps(ResourceId::from_uuid(id))
        .await?;
    let steps: Vec<_> = records
        .iter()
        .map(|record| record.to_step())
        .collect::<Result<_, _>>()?;
    Ok(Json(json!({ "steps": steps })))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let id = ResourceId::from_uuid(id);
    if state.cancel_execution(id) {
        Ok(Json(json!({ "cancelled": true })))
    } else {
        Err(ApiError::NotFound(format!("no running execution {id}")))
    }
}
