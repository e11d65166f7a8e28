//! JSONPath extraction over action results.

use serde_json::Value;

/// Evaluate a JSONPath expression against a value.
///
/// Returns the first match, or `Value::Null` when the path does not match
/// or is malformed — extraction is nil-not-error by design, so an `output`
/// mapping entry always stores something.
pub fn evaluate_json_path(value: &Value, path: &str) -> Value {
    match jsonpath_lib::select(value, path) {
        Ok(matches) => matches.first().map(|v| (*v).clone()).unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}

/// Evaluate a JSONPath expression, keeping every match.
pub fn evaluate_json_path_all(value: &Value, path: &str) -> Vec<Value> {
    jsonpath_lib::select(value, path)
        .map(|matches| matches.into_iter().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_nested_field() {
        let output = json!({ "body": { "token": "T", "user": { "id": 7 } } });
        assert_eq!(evaluate_json_path(&output, "$.body.token"), json!("T"));
        assert_eq!(evaluate_json_path(&output, "$.body.user.id"), json!(7));
    }

    #[test]
    fn test_unmatched_path_yields_null() {
        let output = json!({ "body": {} });
        assert_eq!(evaluate_json_path(&output, "$.body.missing"), Value::Null);
    }

    #[test]
    fn test_malformed_path_yields_null() {
        let output = json!({ "a": 1 });
        assert_eq!(evaluate_json_path(&output, "$..[["), Value::Null);
    }

    #[test]
    fn test_array_indexing() {
        let output = json!({ "rows": [ { "id": 1 }, { "id": 2 } ] });
        assert_eq!(evaluate_json_path(&output, "$.rows[1].id"), json!(2));
        assert_eq!(
            evaluate_json_path_all(&output, "$.rows[*].id"),
            vec![json!(1), json!(2)]
        );
    }
}
