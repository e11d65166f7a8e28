//! Flow definition and system configuration loading for TestMesh.
//!
//! This crate handles:
//! - Flow definitions (JSON or YAML files)
//! - System configuration from environment variables

pub mod error;
pub mod flow;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use flow::{load_flow, load_flow_file, validate_flow};
pub use system::SystemConfig;
