//! Plugin subsystem errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already installed: {0}")]
    Duplicate(String),

    #[error("plugin {0} is not loaded")]
    NotLoaded(String),

    #[error("plugin {id} has type `{plugin_type}` which is not executable")]
    NotExecutable { id: String, plugin_type: String },

    #[error("plugin {id} failed its health check within {timeout_secs}s")]
    HealthTimeout { id: String, timeout_secs: u64 },

    #[error("failed to launch plugin {id}: {message}")]
    Launch { id: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;
