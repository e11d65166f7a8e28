//! Flow management and execution trigger endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use testmesh_core::ResourceId;
use testmesh_core::execution::Execution;
use testmesh_core::flow::Flow;
use testmesh_core::store::ExecutionStore;
use testmesh_db::FlowRepo;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_flows).post(create_flow))
        .route(
            "/{id}",
            get(get_flow).put(update_flow).delete(delete_flow),
        )
        .route("/{id}/executions", get(list_executions).post(trigger_execution))
}

#[derive(Debug, Serialize)]
struct FlowResponse {
    id: String,
    name: String,
    version: String,
    steps: usize,
}

async fn list_flows(State(state): State<AppState>) -> Result<Json<Vec<FlowResponse>>, ApiError> {
    let records = state.flow_repo.list().await?;
    let response = records
        .into_iter()
        .map(|record| {
            let steps = record
                .to_flow()
                .map(|flow| flow.total_steps() as usize)
                .unwrap_or(0);
            FlowResponse {
                id: record.id.to_string(),
                name: record.name,
                version: record.version,
                steps,
            }
        })
        .collect();
    Ok(Json(response))
}

async fn create_flow(
    State(state): State<AppState>,
    Json(flow): Json<Flow>,
) -> Result<Json<FlowResponse>, ApiError> {
    testmesh_config::validate_flow(&flow)?;
    let record = state.flow_repo.create(&flow).await?;
    Ok(Json(FlowResponse {
        id: record.id.to_string(),
        name: record.name,
        version: record.version,
        steps: flow.total_steps() as usize,
    }))
}

async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Flow>, ApiError> {
    let record = state.flow_repo.get_by_id(ResourceId::from_uuid(id)).await?;
    Ok(Json(record.to_flow()?))
}

async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(flow): Json<Flow>,
) -> Result<Json<FlowResponse>, ApiError> {
    testmesh_config::validate_flow(&flow)?;
    let record = state
        .flow_repo
        .update(ResourceId::from_uuid(id), &flow)
        .await?;
    Ok(Json(FlowResponse {
        id: record.id.to_string(),
        name: record.name,
        version: record.version,
        steps: flow.total_steps() as usize,
    }))
}

async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.flow_repo.delete(ResourceId::from_uuid(id)).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default)]
    environment: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    execution_id: String,
    status: String,
}

/// Create an execution record and run the flow on its own task; progress
/// streams over `/ws`.
async fn trigger_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let flow_id = ResourceId::from_uuid(id);
    let flow = state.flow_repo.get_by_id(flow_id).await?.to_flow()?;

    let mut execution = Execution::new(flow_id, request.variables.clone());
    if let Some(environment) = request.environment {
        execution = execution.with_environment(environment);
    }

    state.execution_store.create_execution(&execution).await?;

    let cancel = CancellationToken::new();
    state.track_execution(execution.id, cancel.clone());

    let execution_id = execution.id;
    let executor = state.executor.clone();
    let variables = request.variables;
    let tracker = state.clone();
    tokio::spawn(async move {
        let result = executor
            .execute(&mut execution, &flow, &variables, cancel)
            .await;
        tracker.untrack_execution(execution_id);
        if let Err(e) = result {
            tracing::warn!(execution_id = %execution_id, error = %e, "Execution failed");
        }
    });

    Ok(Json(TriggerResponse {
        execution_id: execution_id.to_string(),
        status: "running".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct ListExecutionsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    20
}

async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state
        .execution_store
        .list_executions(ResourceId::from_uuid(id), query.limit)
        .await?;
    let executions: Vec<Execution> = records
        .iter()
        .map(|record| record.to_execution())
        .collect::<Result<_, _>>()?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}
