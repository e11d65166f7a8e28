//! Flow definition loading and validation.

use std::collections::HashSet;
use std::path::Path;

use testmesh_core::flow::{Flow, Step};

use crate::{ConfigError, ConfigResult};

/// Parse a flow definition from JSON or YAML text.
///
/// JSON is tried first (a JSON document is also valid YAML, so the explicit
/// attempt keeps JSON error messages precise), then YAML.
pub fn load_flow(content: &str) -> ConfigResult<Flow> {
    let flow = match serde_json::from_str::<Flow>(content) {
        Ok(flow) => flow,
        Err(json_err) => {
            // Only fall through to YAML when the text isn't JSON at all.
            if content.trim_start().starts_with(['{', '[']) {
                return Err(json_err.into());
            }
            serde_yaml::from_str::<Flow>(content)?
        }
    };
    validate_flow(&flow)?;
    Ok(flow)
}

/// Read and parse a flow definition file. Format is chosen by extension
/// (`.json`, `.yaml`, `.yml`), falling back to content sniffing.
pub fn load_flow_file(path: impl AsRef<Path>) -> ConfigResult<Flow> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;

    let flow = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str::<Flow>(&content)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str::<Flow>(&content)?,
        Some(other) => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        None => return load_flow(&content),
    };
    validate_flow(&flow)?;
    Ok(flow)
}

/// Structural validation beyond what serde enforces.
pub fn validate_flow(flow: &Flow) -> ConfigResult<()> {
    if flow.name.trim().is_empty() {
        return Err(ConfigError::MissingField("name".to_string()));
    }

    let mut seen_ids = HashSet::new();
    for (phase, steps) in [
        ("setup", &flow.setup),
        ("steps", &flow.steps),
        ("teardown", &flow.teardown),
    ] {
        for (index, step) in steps.iter().enumerate() {
            validate_step(phase, index, step)?;
            if let Some(id) = &step.id {
                if !seen_ids.insert(id.clone()) {
                    return Err(ConfigError::DuplicateStepId(id.clone()));
                }
            }
        }
    }
    Ok(())
}

fn validate_step(phase: &str, index: usize, step: &Step) -> ConfigResult<()> {
    let at = |field: &str| format!("{phase}[{index}].{field}");

    if step.action.trim().is_empty() {
        return Err(ConfigError::MissingField(at("action")));
    }
    if let Some(id) = &step.id {
        if id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: at("id"),
                message: "must not be blank when present".to_string(),
            });
        }
    }
    if let Some(retry) = &step.retry {
        if retry.max_attempts < 1 {
            return Err(ConfigError::InvalidValue {
                field: at("retry.max_attempts"),
                message: "must be at least 1".to_string(),
            });
        }
    }
    for (var, path) in &step.output {
        if !path.starts_with('$') {
            return Err(ConfigError::InvalidValue {
                field: at(&format!("output.{var}")),
                message: format!("JSONPath must start with `$`, got `{path}`"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_FLOW: &str = r#"{
        "name": "smoke",
        "version": "1",
        "env": { "HOST": "api.test" },
        "steps": [
            { "id": "ping", "name": "Ping", "action": "http_request",
              "config": { "method": "GET", "url": "http://${HOST}/ping" },
              "assert": ["status == 200"],
              "output": { "latency": "$.duration_ms" } }
        ]
    }"#;

    const YAML_FLOW: &str = r#"
name: smoke
version: "1"
env:
  HOST: api.test
steps:
  - id: ping
    name: Ping
    action: http_request
    config:
      method: GET
      url: http://${HOST}/ping
    assert:
      - status == 200
"#;

    #[test]
    fn test_loads_json_flow() {
        let flow = load_flow(JSON_FLOW).unwrap();
        assert_eq!(flow.name, "smoke");
        assert_eq!(flow.steps[0].id.as_deref(), Some("ping"));
    }

    #[test]
    fn test_loads_yaml_flow() {
        let flow = load_flow(YAML_FLOW).unwrap();
        assert_eq!(flow.name, "smoke");
        assert_eq!(flow.env["HOST"], "api.test");
    }

    #[test]
    fn test_malformed_json_reports_json_error() {
        let err = load_flow("{ \"name\": ").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_rejects_duplicate_step_ids() {
        let err = load_flow(
            r#"{
                "name": "dup",
                "steps": [
                    { "id": "a", "name": "one", "action": "log", "config": {} },
                    { "id": "a", "name": "two", "action": "log", "config": {} }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn test_rejects_blank_action() {
        let err = load_flow(
            r#"{ "name": "f", "steps": [ { "name": "x", "action": " ", "config": {} } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "steps[0].action"));
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let err = load_flow(
            r#"{ "name": "f", "steps": [ { "name": "x", "action": "log", "config": {},
                 "retry": { "max_attempts": 0 } } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field.contains("max_attempts")));
    }

    #[test]
    fn test_rejects_non_jsonpath_output() {
        let err = load_flow(
            r#"{ "name": "f", "steps": [ { "name": "x", "action": "log", "config": {},
                 "output": { "v": "body.token" } } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field.contains("output.v")));
    }

    #[test]
    fn test_load_flow_file_by_extension() {
        let dir = std::env::temp_dir().join(format!("testmesh-flow-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let json_path = dir.join("flow.json");
        let yaml_path = dir.join("flow.yaml");
        std::fs::write(&json_path, JSON_FLOW).unwrap();
        std::fs::write(&yaml_path, YAML_FLOW).unwrap();

        assert_eq!(load_flow_file(&json_path).unwrap().name, "smoke");
        assert_eq!(load_flow_file(&yaml_path).unwrap().name, "smoke");

        std::fs::remove_dir_all(&dir).ok();
    }
}
