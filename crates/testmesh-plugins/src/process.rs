//! Plugin subprocess supervisor.
//!
//! Owns the process handle, the stdout/stderr pumps, the startup health
//! poller and the shutdown state machine for one plugin subprocess.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::protocol::HealthResponse;
use crate::{PluginError, PluginManifest, PluginResult};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A live plugin subprocess that has passed at least one health check.
#[derive(Debug)]
pub struct PluginProcess {
    id: String,
    port: u16,
    child: Child,
}

impl PluginProcess {
    /// Launch the plugin's entry point and wait for it to become healthy.
    ///
    /// The subprocess gets `PLUGIN_PORT` and `PLUGIN_ID` in its environment
    /// and the plugin directory as its working directory. Stdout and stderr
    /// are pumped into the logger tagged with the plugin id. A plugin that
    /// does not answer `GET /health` with `{"status":"healthy"}` within the
    /// startup window is killed.
    pub async fn launch(
        manifest: &PluginManifest,
        dir: &Path,
        http: &reqwest::Client,
    ) -> PluginResult<Self> {
        let port = allocate_loopback_port()?;
        let entry = dir.join(&manifest.entry_point);

        let mut command = interpreter_for(&entry);
        command
            .current_dir(dir)
            .env("PLUGIN_PORT", port.to_string())
            .env("PLUGIN_ID", &manifest.id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(plugin = %manifest.id, entry = %entry.display(), port, "Launching plugin");
        let mut child = command.spawn().map_err(|e| PluginError::Launch {
            id: manifest.id.clone(),
            message: e.to_string(),
        })?;

        pump_output(&manifest.id, &mut child);

        let mut process = Self {
            id: manifest.id.clone(),
            port,
            child,
        };

        if let Err(e) = process.wait_healthy(http).await {
            warn!(plugin = %process.id, error = %e, "Plugin failed startup health check, killing");
            process.kill().await;
            return Err(e);
        }

        info!(plugin = %process.id, port, "Plugin healthy");
        Ok(process)
    }

    /// Loopback base URL of the plugin's HTTP endpoint.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn wait_healthy(&mut self, http: &reqwest::Client) -> PluginResult<()> {
        let url = format!("{}/health", self.base_url());
        let deadline = tokio::time::Instant::now() + HEALTH_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            // A subprocess that already exited will never become healthy.
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(PluginError::Launch {
                    id: self.id.clone(),
                    message: format!("exited during startup with {status}"),
                });
            }

            match http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<HealthResponse>().await {
                        Ok(health) if health.is_healthy() => return Ok(()),
                        Ok(health) => {
                            debug!(plugin = %self.id, status = %health.status, "Plugin not ready")
                        }
                        Err(e) => debug!(plugin = %self.id, error = %e, "Bad health body"),
                    }
                }
                Ok(response) => {
                    debug!(plugin = %self.id, status = %response.status(), "Health probe rejected")
                }
                Err(_) => {} // not listening yet
            }

            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        Err(PluginError::HealthTimeout {
            id: self.id.clone(),
            timeout_secs: HEALTH_TIMEOUT.as_secs(),
        })
    }

    /// Graceful stop: `POST /shutdown`, wait for exit, then kill if the
    /// process is still alive after the grace period.
    pub async fn shutdown(mut self, http: &reqwest::Client) {
        let url = format!("{}/shutdown", self.base_url());
        if let Err(e) = http.post(&url).send().await {
            debug!(plugin = %self.id, error = %e, "Shutdown request failed, will kill");
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(plugin = %self.id, %status, "Plugin stopped");
            }
            Ok(Err(e)) => {
                warn!(plugin = %self.id, error = %e, "Failed to reap plugin, killing");
                self.kill().await;
            }
            Err(_) => {
                warn!(plugin = %self.id, "Plugin ignored shutdown, killing");
                self.kill().await;
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(plugin = %self.id, error = %e, "Failed to kill plugin process");
        }
    }
}

/// Select the interpreter by entry-point extension; anything unrecognized
/// is executed directly.
fn interpreter_for(entry: &Path) -> Command {
    match entry.extension().and_then(|e| e.to_str()) {
        Some("js") => {
            let mut cmd = Command::new("node");
            cmd.arg(entry);
            cmd
        }
        Some("py") => {
            let mut cmd = Command::new("python3");
            cmd.arg(entry);
            cmd
        }
        Some("sh") => {
            let mut cmd = Command::new("bash");
            cmd.arg(entry);
            cmd
        }
        _ => Command::new(entry),
    }
}

/// Reserve an ephemeral loopback port by binding to port 0 and releasing
/// the listener. The plugin binds the port itself shortly after.
fn allocate_loopback_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Route subprocess stdout/stderr lines through the logger.
fn pump_output(plugin_id: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let id = plugin_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(plugin = %id, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = plugin_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(plugin = %id, "{line}");
            }
        });
    }
}
