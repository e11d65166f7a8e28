//! Per-execution context: variables, step outputs and interpolation.
//!
//! Supported `${...}` tokens, substituted in a fixed order:
//! - `${RANDOM_ID}` - fresh UUIDv4 per occurrence
//! - `${TIMESTAMP}` - seconds since epoch
//! - `${ISO_TIMESTAMP}` - current time, RFC 3339
//! - `${stepId.outputKey}` - a prior step's extracted output
//! - `${NAME}` - any context variable
//!
//! Built-ins win over step outputs, step outputs win over variables, so a
//! user variable named `TIMESTAMP` can never shadow the built-in. Unknown
//! tokens are left verbatim; interpolation is total and never fails.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

// Token names cover plain variables and dotted step references.
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_-]*(?:\.[A-Za-z_][A-Za-z0-9_-]*)?)\}").unwrap()
});

/// Mutable per-execution state. Single-writer: only the executor mutates it;
/// handlers observe values through their interpolated config.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    variables: HashMap<String, String>,
    step_outputs: HashMap<String, Map<String, Value>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a scalar variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    /// Set a scalar variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Store one extracted output value for a step.
    pub fn set_step_output(&mut self, step_id: &str, key: impl Into<String>, value: Value) {
        self.step_outputs
            .entry(step_id.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    /// Get one extracted output value of a step.
    pub fn get_step_output(&self, step_id: &str, key: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)?.get(key)
    }

    /// Snapshot of the scalar variables (for handler envelopes).
    pub fn variables(&self) -> HashMap<String, String> {
        self.variables.clone()
    }

    /// Snapshot of all step outputs (forwarded to plugins).
    pub fn step_outputs(&self) -> HashMap<String, Map<String, Value>> {
        self.step_outputs.clone()
    }

    /// Substitute all `${...}` tokens in a string. Unknown tokens remain
    /// verbatim so downstream consumers (e.g. plugins) may interpolate
    /// their own.
    pub fn interpolate(&self, input: &str) -> String {
        TOKEN_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let token = &caps[1];
                self.resolve(token)
                    .unwrap_or_else(|| format!("${{{token}}}"))
            })
            .to_string()
    }

    /// Apply [`interpolate`](Self::interpolate) to every string leaf of a
    /// value tree, preserving non-string scalars.
    pub fn interpolate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.interpolate(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.interpolate_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.interpolate_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Interpolate a step config mapping.
    pub fn interpolate_config(&self, config: &Map<String, Value>) -> Value {
        self.interpolate_value(&Value::Object(config.clone()))
    }

    fn resolve(&self, token: &str) -> Option<String> {
        // Built-ins first.
        match token {
            "RANDOM_ID" => return Some(uuid::Uuid::new_v4().to_string()),
            "TIMESTAMP" => return Some(chrono::Utc::now().timestamp().to_string()),
            "ISO_TIMESTAMP" => {
                return Some(
                    chrono::Utc::now()
                        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                );
            }
            _ => {}
        }

        // Step references next.
        if let Some((step_id, key)) = token.split_once('.') {
            if let Some(value) = self
                .step_outputs
                .get(step_id)
                .and_then(|outputs| outputs.get(key))
            {
                return Some(value_to_string(value));
            }
        }

        // Plain variables last.
        self.variables.get(token).cloned()
    }
}

/// String form of an output value for embedding into interpolated text.
/// Strings are used verbatim; everything else renders as compact JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
