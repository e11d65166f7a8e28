//! Wire types for the loopback plugin HTTP protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use testmesh_core::ResourceId;

/// Body of `POST /execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    /// Full original action name (`kafka.produce`, not the plugin id).
    pub action: String,
    pub config: Value,
    pub context: ExecuteContext,
}

/// Ambient execution context forwarded to the plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteContext {
    pub execution_id: ResourceId,
    pub flow_id: ResourceId,
    pub step_id: String,
    pub variables: HashMap<String, String>,
    pub step_outputs: HashMap<String, Map<String, Value>>,
}

/// Response of `POST /execute`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub output: Option<Map<String, Value>>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub metrics: Option<Value>,
}

/// Structured plugin failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Log line emitted by the plugin during `execute`, forwarded to the
/// central logger.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<f64>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Response of `GET /info`.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoResponse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<ActionInfo>,
}

/// One action advertised by a plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Option<Value>,
}
