//! Flow and step definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::ResourceId;

/// A declarative, multi-step test scenario.
///
/// A flow is immutable for the duration of one execution. Field names match
/// the JSON/YAML wire format exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Assigned when the flow is persisted; absent in flow files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    /// Flow name (e.g., "checkout-happy-path").
    pub name: String,
    /// Definition version label.
    #[serde(default)]
    pub version: String,
    /// Initial context variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Steps run before the main phase; a failure aborts the flow.
    #[serde(default)]
    pub setup: Vec<Step>,
    /// Main phase steps.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Steps run after the main phase, best-effort on failure.
    #[serde(default)]
    pub teardown: Vec<Step>,
}

impl Flow {
    /// Total number of steps across all three phases.
    pub fn total_steps(&self) -> u32 {
        (self.setup.len() + self.steps.len() + self.teardown.len()) as u32
    }
}

/// A single action within a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier used for output references (`${id.key}`).
    /// When empty the executor assigns `<phase>_<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable name.
    pub name: String,
    /// Action identifier resolving a handler (e.g. `http_request`).
    pub action: String,
    /// Handler configuration; string leaves may contain `${...}` tokens.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Boolean expressions evaluated against the action result, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assert: Vec<String>,
    /// Output variable name → JSONPath over the action result.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: HashMap<String, String>,
    /// Retry policy for action-level failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Retry policy for a step. Applies only to action failures, never to
/// config, assertion or cancellation failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, counted from 1.
    pub max_attempts: u32,
    /// Delay between attempts as a duration string ("50ms", "2s").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// How the delay evolves between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}
