//! Plugin management endpoints.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::AppState;
use crate::error::ApiError;
use testmesh_plugins::PluginRecord;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_plugins).post(install_plugin))
        .route("/discover", post(discover_plugins))
        .route("/{id}", delete(uninstall_plugin))
        .route("/{id}/load", post(load_plugin))
        .route("/{id}/unload", post(unload_plugin))
        .route("/{id}/info", get(plugin_info))
}

#[derive(Debug, Serialize)]
struct PluginResponse {
    id: String,
    name: String,
    version: String,
    plugin_type: String,
    enabled: bool,
    loaded: bool,
    error: Option<String>,
}

impl From<PluginRecord> for PluginResponse {
    fn from(record: PluginRecord) -> Self {
        Self {
            id: record.manifest.id,
            name: record.manifest.name,
            version: record.manifest.version,
            plugin_type: record.manifest.plugin_type.as_str().to_string(),
            enabled: record.enabled,
            loaded: record.loaded,
            error: record.error,
        }
    }
}

async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginResponse>> {
    let records = state.plugins.list().await;
    Json(records.into_iter().map(PluginResponse::from).collect())
}

async fn discover_plugins(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let found = state.plugins.discover().await?;
    Ok(Json(json!({ "discovered": found })))
}

#[derive(Debug, Deserialize)]
struct InstallRequest {
    /// Directory on the server containing the plugin to install.
    source_path: PathBuf,
}

async fn install_plugin(
    State(state): State<AppState>,
    Json(request): Json<InstallRequest>,
) -> Result<Json<PluginResponse>, ApiError> {
    let record = state.plugins.install(&request.source_path).await?;
    Ok(Json(record.into()))
}

async fn load_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.plugins.load(&id).await?;
    Ok(Json(json!({ "loaded": true })))
}

async fn unload_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.plugins.unload(&id).await?;
    Ok(Json(json!({ "loaded": false })))
}

async fn uninstall_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.plugins.uninstall(&id).await?;
    Ok(Json(json!({ "uninstalled": true })))
}

async fn plugin_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let info = state.plugins.info(&id).await?;
    Ok(Json(json!({
        "id": info.id,
        "name": info.name,
        "version": info.version,
        "description": info.description,
        "actions": info.actions.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
    })))
}
