//! `http_request` handler.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::Instant;

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

/// Performs one HTTP request.
///
/// Config: `{ method, url, headers?, body? }`. The body serializes as JSON
/// unless a `Content-Type` header says otherwise; `application/json` is set
/// by default when a body is present. Output:
/// `{ status, body, headers, duration_ms, content_type }` with the body
/// parsed as JSON when decodable, raw text otherwise.
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for HttpRequestHandler {
    fn name(&self) -> &str {
        "http_request"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let method_text = view.require_str("method")?;
        let url = view.require_str("url")?;

        let method: reqwest::Method = method_text
            .to_uppercase()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("invalid HTTP method `{method_text}`")))?;

        let mut request = self.client.request(method, url);

        let mut content_type_set = false;
        if let Some(headers) = view.object_opt("headers")? {
            for (name, value) in headers {
                let value = scalar_text(name, value)?;
                if name.eq_ignore_ascii_case("content-type") {
                    content_type_set = true;
                }
                request = request.header(name, value);
            }
        }

        if let Some(body) = view.value("body") {
            if !content_type_set {
                request = request.header("Content-Type", "application/json");
            }
            // A string body with an explicit content type is sent verbatim;
            // everything else serializes as JSON.
            request = match body {
                Value::String(text) if content_type_set => request.body(text.clone()),
                other => request.body(serde_json::to_vec(other).map_err(|e| {
                    Error::InvalidConfig(format!("unserializable body: {e}"))
                })?),
            };
        }

        let started = Instant::now();
        let response = tokio::select! {
            _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
            response = request.send() => {
                response.map_err(|e| Error::Handler(format!("request to {url} failed: {e}")))?
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut headers = Map::new();
        for name in response.headers().keys() {
            let values: Vec<&str> = response
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            headers.insert(name.to_string(), json!(values.join(", ")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Handler(format!("failed to read response body: {e}")))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let duration_ms = started.elapsed().as_millis() as u64;

        let mut output = Output::new();
        output.insert("status".into(), json!(status));
        output.insert("body".into(), body);
        output.insert("headers".into(), Value::Object(headers));
        output.insert("duration_ms".into(), json!(duration_ms));
        output.insert("content_type".into(), json!(content_type));
        Ok(output)
    }
}

fn scalar_text(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::InvalidConfig(format!(
            "header `{name}` must be scalar, got {other}"
        ))),
    }
}
