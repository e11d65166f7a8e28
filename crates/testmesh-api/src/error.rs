//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<testmesh_core::Error> for ApiError {
    fn from(err: testmesh_core::Error) -> Self {
        match err {
            testmesh_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            testmesh_core::Error::InvalidConfig(msg) => ApiError::BadRequest(msg),
            testmesh_core::Error::UnknownAction(msg) => ApiError::BadRequest(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<testmesh_db::DbError> for ApiError {
    fn from(err: testmesh_db::DbError) -> Self {
        match err {
            testmesh_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            testmesh_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<testmesh_config::ConfigError> for ApiError {
    fn from(err: testmesh_config::ConfigError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<testmesh_plugins::PluginError> for ApiError {
    fn from(err: testmesh_plugins::PluginError) -> Self {
        match err {
            testmesh_plugins::PluginError::NotFound(msg) => ApiError::NotFound(msg),
            testmesh_plugins::PluginError::Duplicate(msg) => ApiError::Conflict(msg),
            testmesh_plugins::PluginError::Manifest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
