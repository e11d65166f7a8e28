//! `wait_for` handler.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};
use testmesh_engine::extract;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Polls an HTTP endpoint or TCP port until a condition holds.
///
/// HTTP mode (`url`): the condition is any combination of `status`,
/// `body_contains` and `jsonpath`+`equals`; with none given, any 2xx
/// response counts. TCP mode (`host` + `port`): the port accepting a
/// connection counts.
///
/// Polling runs at `interval` cadence until `timeout` elapses or
/// `max_attempts` is reached. Output:
/// `{ success, attempts, duration_ms, last_result }` — an exhausted wait
/// reports `success: false` rather than failing the step, so flows can
/// assert on it.
pub struct WaitForHandler {
    client: reqwest::Client,
}

impl WaitForHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WaitForHandler {
    fn default() -> Self {
        Self::new()
    }
}

enum Target {
    Http {
        url: String,
        status: Option<u16>,
        body_contains: Option<String>,
        jsonpath: Option<(String, Value)>,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

#[async_trait]
impl ActionHandler for WaitForHandler {
    fn name(&self) -> &str {
        "wait_for"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let target = parse_target(&view)?;

        let timeout = parse_duration_opt(&view, "timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        let interval = parse_duration_opt(&view, "interval")?.unwrap_or(DEFAULT_INTERVAL);
        let max_attempts = view.u64_opt("max_attempts")?.unwrap_or(u64::MAX).max(1);

        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts: u64 = 0;
        let mut success = false;
        let mut last_result = Value::Null;

        loop {
            attempts += 1;
            let (met, observed) = tokio::select! {
                _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
                probed = probe(&self.client, &target) => probed,
            };
            last_result = observed;
            if met {
                success = true;
                break;
            }
            if attempts >= max_attempts || Instant::now() + interval > deadline {
                break;
            }
            tokio::select! {
                _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let mut output = Output::new();
        output.insert("success".into(), json!(success));
        output.insert("attempts".into(), json!(attempts));
        output.insert(
            "duration_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );
        output.insert("last_result".into(), last_result);
        Ok(output)
    }
}

fn parse_target(view: &ConfigView<'_>) -> Result<Target> {
    if let Some(url) = view.str_opt("url")? {
        let status = view.u64_opt("status")?.map(|s| s as u16);
        let body_contains = view.str_opt("body_contains")?.map(String::from);
        let jsonpath = match view.str_opt("jsonpath")? {
            Some(path) => {
                let expected = view.require_value("equals")?.clone();
                Some((path.to_string(), expected))
            }
            None => None,
        };
        return Ok(Target::Http {
            url: url.to_string(),
            status,
            body_contains,
            jsonpath,
        });
    }

    match (view.str_opt("host")?, view.u64_opt("port")?) {
        (Some(host), Some(port)) => Ok(Target::Tcp {
            host: host.to_string(),
            port: port as u16,
        }),
        _ => Err(Error::InvalidConfig(
            "wait_for needs either `url` or `host` + `port`".into(),
        )),
    }
}

fn parse_duration_opt(view: &ConfigView<'_>, key: &str) -> Result<Option<Duration>> {
    match view.str_opt(key)? {
        None => Ok(None),
        Some(text) => humantime::parse_duration(text)
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("invalid {key} `{text}`: {e}"))),
    }
}

/// One probe. Returns whether the condition held plus what was observed.
async fn probe(client: &reqwest::Client, target: &Target) -> (bool, Value) {
    match target {
        Target::Tcp { host, port } => {
            let open = TcpStream::connect((host.as_str(), *port)).await.is_ok();
            (open, json!({ "connected": open }))
        }
        Target::Http {
            url,
            status,
            body_contains,
            jsonpath,
        } => {
            let response = match client.get(url).send().await {
                Ok(response) => response,
                Err(e) => return (false, json!({ "error": e.to_string() })),
            };

            let observed_status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            let observed = json!({ "status": observed_status, "body": body });

            let status_ok = match status {
                Some(expected) => observed_status == *expected,
                // Bare URL waits accept any 2xx.
                None if body_contains.is_none() && jsonpath.is_none() => {
                    (200..300).contains(&observed_status)
                }
                None => true,
            };
            let contains_ok = body_contains.as_ref().is_none_or(|needle| {
                observed["body"]
                    .as_str()
                    .map(|s| s.contains(needle))
                    .unwrap_or_else(|| observed["body"].to_string().contains(needle))
            });
            let jsonpath_ok = jsonpath.as_ref().is_none_or(|(path, expected)| {
                extract::evaluate_json_path(&observed["body"], path) == *expected
            });

            (status_ok && contains_ok && jsonpath_ok, observed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmesh_core::ResourceId;

    fn envelope() -> CallEnvelope {
        CallEnvelope::new(ResourceId::new(), ResourceId::new(), "wait-step")
    }

    #[tokio::test]
    async fn test_succeeds_once_endpoint_is_healthy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ready")
            .with_status(200)
            .with_body(r#"{"state":"up"}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let handler = WaitForHandler::new();
        let config = json!({
            "url": format!("{}/ready", server.url()),
            "jsonpath": "$.state",
            "equals": "up",
            "interval": "10ms",
            "timeout": "2s"
        });

        let output = handler.execute(&envelope(), &config).await.unwrap();
        assert_eq!(output["success"], true);
        assert_eq!(output["attempts"], 1);
        assert_eq!(output["last_result"]["body"]["state"], "up");
    }

    #[tokio::test]
    async fn test_max_attempts_caps_the_polling() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ready")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let handler = WaitForHandler::new();
        let config = json!({
            "url": format!("{}/ready", server.url()),
            "interval": "10ms",
            "timeout": "10s",
            "max_attempts": 3
        });

        let output = handler.execute(&envelope(), &config).await.unwrap();
        mock.assert_async().await;
        assert_eq!(output["success"], false);
        assert_eq!(output["attempts"], 3);
        assert_eq!(output["last_result"]["status"], 503);
    }

    #[tokio::test]
    async fn test_tcp_probe_detects_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handler = WaitForHandler::new();
        let config = json!({
            "host": "127.0.0.1",
            "port": port,
            "interval": "10ms",
            "timeout": "2s"
        });

        let output = handler.execute(&envelope(), &config).await.unwrap();
        assert_eq!(output["success"], true);
        assert_eq!(output["last_result"]["connected"], true);
    }

    #[tokio::test]
    async fn test_requires_a_target() {
        let handler = WaitForHandler::new();
        let err = handler
            .execute(&envelope(), &json!({ "interval": "1s" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_body_contains_condition() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/log")
            .with_status(200)
            .with_body("startup complete")
            .create_async()
            .await;

        let handler = WaitForHandler::new();
        let config = json!({
            "url": format!("{}/log", server.url()),
            "body_contains": "complete",
            "timeout": "2s",
            "interval": "10ms"
        });

        let output = handler.execute(&envelope(), &config).await.unwrap();
        assert_eq!(output["success"], true);
    }
}
