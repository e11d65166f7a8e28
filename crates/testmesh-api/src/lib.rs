//! API server for TestMesh.
//!
//! Provides the HTTP REST API and the WebSocket event stream.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
