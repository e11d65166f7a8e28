//! Collection run endpoints.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use testmesh_core::ResourceId;
use testmesh_db::FlowRepo;
use testmesh_engine::collection::{CollectionConfig, CollectionResult, DataRow, DataSource};

pub fn router() -> Router<AppState> {
    Router::new().route("/run", post(run_collection))
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    flow_ids: Vec<Uuid>,
    #[serde(default)]
    data_source: Option<DataSourceRequest>,
    #[serde(default = "default_iterations")]
    iterations: u32,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    stop_on_error: bool,
    #[serde(default = "default_parallel")]
    parallel: usize,
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default)]
    variable_mapping: HashMap<String, String>,
    #[serde(default)]
    environment: Option<String>,
}

fn default_iterations() -> u32 {
    1
}

fn default_parallel() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DataSourceRequest {
    Csv { content: String },
    Json { content: String },
    Inline { rows: Vec<DataRow> },
}

impl From<DataSourceRequest> for DataSource {
    fn from(request: DataSourceRequest) -> Self {
        match request {
            DataSourceRequest::Csv { content } => DataSource::Csv(content),
            DataSourceRequest::Json { content } => DataSource::Json(content),
            DataSourceRequest::Inline { rows } => DataSource::Inline(rows),
        }
    }
}

async fn run_collection(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<CollectionResult>, ApiError> {
    if request.flow_ids.is_empty() {
        return Err(ApiError::BadRequest("flow_ids must not be empty".into()));
    }

    let mut flows = Vec::with_capacity(request.flow_ids.len());
    for id in &request.flow_ids {
        let record = state
            .flow_repo
            .get_by_id(ResourceId::from_uuid(*id))
            .await?;
        flows.push(record.to_flow()?);
    }

    let config = CollectionConfig {
        iterations: request.iterations,
        delay_ms: request.delay_ms,
        stop_on_error: request.stop_on_error,
        parallel: request.parallel,
        variables: request.variables,
        variable_mapping: request.variable_mapping,
        environment: request.environment,
    };

    let result = state
        .collection_runner
        .run(
            flows,
            request.data_source.map(DataSource::from),
            config,
            CancellationToken::new(),
        )
        .await?;

    Ok(Json(result))
}
