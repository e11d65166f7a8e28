//! Plugin registry: discovery, install, lifecycle and action resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use testmesh_core::Error;
use testmesh_core::handler::{CallEnvelope, Output};

use crate::manifest::{MANIFEST_FILE, PluginManifest, PluginType};
use crate::process::PluginProcess;
use crate::protocol::{ExecuteContext, ExecuteRequest, ExecuteResponse, InfoResponse};
use crate::{PluginError, PluginResult};

/// Registry view of one installed plugin.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub path: PathBuf,
    pub enabled: bool,
    pub loaded: bool,
    pub error: Option<String>,
}

/// A loaded plugin reachable over loopback HTTP.
struct LoadedHandle {
    id: String,
    base_url: String,
    http: reqwest::Client,
    process: Mutex<Option<PluginProcess>>,
}

/// Discovers, installs, starts, health-checks, dispatches to and stops
/// subprocess plugins.
///
/// Reads (action resolution) take the read half of the locks; mutations
/// (install, load, enable/disable, unload, uninstall) serialize on the
/// write half. `load` never holds a write lock while the health poller
/// runs — the record is only inserted after health confirmation.
pub struct PluginRegistry {
    plugin_dir: PathBuf,
    http: reqwest::Client,
    plugins: RwLock<HashMap<String, PluginRecord>>,
    loaded: RwLock<HashMap<String, Arc<LoadedHandle>>>,
}

impl PluginRegistry {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            http: reqwest::Client::new(),
            plugins: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    /// Scan the plugin directory for sub-directories containing a
    /// `manifest.json`. Malformed manifests are logged and skipped.
    /// Re-running discovery never duplicates records.
    pub async fn discover(&self) -> PluginResult<Vec<String>> {
        if !self.plugin_dir.is_dir() {
            debug!(dir = %self.plugin_dir.display(), "Plugin directory absent, nothing to discover");
            return Ok(Vec::new());
        }

        let mut discovered = Vec::new();
        for entry in std::fs::read_dir(&self.plugin_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join(MANIFEST_FILE).is_file() {
                continue;
            }

            let manifest = match PluginManifest::load(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "Skipping plugin with bad manifest");
                    continue;
                }
            };

            let mut plugins = self.plugins.write().await;
            match plugins.get_mut(&manifest.id) {
                // Refresh the manifest of known, unloaded plugins; a loaded
                // plugin keeps the manifest its process was started from.
                Some(record) if !record.loaded => {
                    record.manifest = manifest.clone();
                    record.path = path.clone();
                }
                Some(_) => {}
                None => {
                    info!(plugin = %manifest.id, dir = %path.display(), "Discovered plugin");
                    plugins.insert(
                        manifest.id.clone(),
                        PluginRecord {
                            manifest: manifest.clone(),
                            path: path.clone(),
                            enabled: true,
                            loaded: false,
                            error: None,
                        },
                    );
                }
            }
            discovered.push(manifest.id);
        }

        discovered.sort();
        Ok(discovered)
    }

    /// Install a plugin from a source directory: validate the manifest,
    /// ensure the id is unique, copy the tree into the plugin directory and
    /// register the record. File copies roll back on failure.
    pub async fn install(&self, source: &Path) -> PluginResult<PluginRecord> {
        let manifest = PluginManifest::load(source)?;

        {
            let plugins = self.plugins.read().await;
            if plugins.contains_key(&manifest.id) {
                return Err(PluginError::Duplicate(manifest.id));
            }
        }

        let dest = self.plugin_dir.join(&manifest.id);
        if dest.exists() {
            return Err(PluginError::Duplicate(manifest.id));
        }

        if let Err(e) = copy_dir_all(source, &dest) {
            // Roll back partial copies.
            let _ = std::fs::remove_dir_all(&dest);
            return Err(e.into());
        }

        let record = PluginRecord {
            manifest: manifest.clone(),
            path: dest,
            enabled: true,
            loaded: false,
            error: None,
        };

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&manifest.id) {
            // Raced with a concurrent install of the same id.
            let _ = std::fs::remove_dir_all(&record.path);
            return Err(PluginError::Duplicate(manifest.id));
        }
        plugins.insert(manifest.id.clone(), record.clone());
        info!(plugin = %manifest.id, "Installed plugin");
        Ok(record)
    }

    /// Launch the plugin subprocess and register it as the handler for its
    /// id once it passes the health check.
    pub async fn load(&self, id: &str) -> PluginResult<()> {
        let (manifest, path) = {
            let plugins = self.plugins.read().await;
            let record = plugins
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            if record.loaded {
                return Ok(());
            }
            if !record.enabled {
                return Err(PluginError::Launch {
                    id: id.to_string(),
                    message: "plugin is disabled".to_string(),
                });
            }
            if record.manifest.plugin_type != PluginType::Action {
                return Err(PluginError::NotExecutable {
                    id: id.to_string(),
                    plugin_type: record.manifest.plugin_type.as_str().to_string(),
                });
            }
            (record.manifest.clone(), record.path.clone())
        };

        // Launch and health-poll without holding any lock.
        match PluginProcess::launch(&manifest, &path, &self.http).await {
            Ok(process) => {
                let handle = Arc::new(LoadedHandle {
                    id: id.to_string(),
                    base_url: process.base_url(),
                    http: self.http.clone(),
                    process: Mutex::new(Some(process)),
                });
                self.loaded.write().await.insert(id.to_string(), handle);
                if let Some(record) = self.plugins.write().await.get_mut(id) {
                    record.loaded = true;
                    record.error = None;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(record) = self.plugins.write().await.get_mut(id) {
                    record.error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Stop the plugin subprocess and de-register it from the action table.
    pub async fn unload(&self, id: &str) -> PluginResult<()> {
        let handle = self.loaded.write().await.remove(id);
        match handle {
            Some(handle) => {
                if let Some(process) = handle.process.lock().await.take() {
                    process.shutdown(&self.http).await;
                }
                if let Some(record) = self.plugins.write().await.get_mut(id) {
                    record.loaded = false;
                }
                Ok(())
            }
            None => {
                let plugins = self.plugins.read().await;
                if plugins.contains_key(id) {
                    Ok(()) // installed but not loaded
                } else {
                    Err(PluginError::NotFound(id.to_string()))
                }
            }
        }
    }

    /// Unload if loaded, drop the record and remove the plugin's files.
    pub async fn uninstall(&self, id: &str) -> PluginResult<()> {
        let _ = self.unload(id).await;

        let record = self
            .plugins
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        if record.path.starts_with(&self.plugin_dir) && record.path.exists() {
            std::fs::remove_dir_all(&record.path)?;
        }
        info!(plugin = %id, "Uninstalled plugin");
        Ok(())
    }

    /// Mark a plugin usable without loading it.
    pub async fn enable(&self, id: &str) -> PluginResult<()> {
        let mut plugins = self.plugins.write().await;
        let record = plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        record.enabled = true;
        Ok(())
    }

    /// Disable a plugin, unloading it first when necessary.
    pub async fn disable(&self, id: &str) -> PluginResult<()> {
        let _ = self.unload(id).await;
        let mut plugins = self.plugins.write().await;
        let record = plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        record.enabled = false;
        Ok(())
    }

    /// All records, sorted by id.
    pub async fn list(&self) -> Vec<PluginRecord> {
        let plugins = self.plugins.read().await;
        let mut records: Vec<_> = plugins.values().cloned().collect();
        records.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        records
    }

    pub async fn get(&self, id: &str) -> Option<PluginRecord> {
        self.plugins.read().await.get(id).cloned()
    }

    /// Resolve an action name against loaded plugins: exact id match first,
    /// then the prefix before the first `.` (the full action name is
    /// forwarded to the plugin as `_action`).
    pub async fn resolve(&self, action: &str) -> Option<ResolvedPlugin> {
        let loaded = self.loaded.read().await;
        if let Some(handle) = loaded.get(action) {
            return Some(ResolvedPlugin {
                handle: handle.clone(),
                action: action.to_string(),
                prefixed: false,
            });
        }
        if let Some((prefix, _)) = action.split_once('.') {
            if let Some(handle) = loaded.get(prefix) {
                return Some(ResolvedPlugin {
                    handle: handle.clone(),
                    action: action.to_string(),
                    prefixed: true,
                });
            }
        }
        None
    }

    /// Query a loaded plugin's `GET /info` endpoint.
    pub async fn info(&self, id: &str) -> PluginResult<InfoResponse> {
        let loaded = self.loaded.read().await;
        let handle = loaded
            .get(id)
            .ok_or_else(|| PluginError::NotLoaded(id.to_string()))?
            .clone();
        drop(loaded);

        let url = format!("{}/info", handle.base_url);
        let response = handle.http.get(&url).send().await.map_err(|e| {
            PluginError::Launch {
                id: id.to_string(),
                message: format!("info request failed: {e}"),
            }
        })?;
        response
            .json::<InfoResponse>()
            .await
            .map_err(|e| PluginError::Launch {
                id: id.to_string(),
                message: format!("bad info response: {e}"),
            })
    }

    /// Shut down every loaded plugin (process exit path).
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                warn!(plugin = %id, error = %e, "Failed to unload plugin during shutdown");
            }
        }
    }
}

/// An action resolved to a loaded plugin, ready to invoke.
pub struct ResolvedPlugin {
    handle: Arc<LoadedHandle>,
    action: String,
    prefixed: bool,
}

impl ResolvedPlugin {
    /// Id of the plugin that will serve the call.
    pub fn plugin_id(&self) -> &str {
        &self.handle.id
    }

    /// Invoke `POST /execute` on the plugin.
    ///
    /// Prefix-resolved calls get the full original action name injected as
    /// `_action` in the config. Plugin log entries are forwarded through
    /// the central logger; structured errors surface their code.
    pub async fn execute(
        &self,
        envelope: &CallEnvelope,
        config: &Value,
    ) -> testmesh_core::Result<Output> {
        let mut config = config.clone();
        if self.prefixed {
            if let Some(map) = config.as_object_mut() {
                map.insert("_action".to_string(), Value::String(self.action.clone()));
            }
        }

        let request = ExecuteRequest {
            action: self.action.clone(),
            config,
            context: ExecuteContext {
                execution_id: envelope.execution_id,
                flow_id: envelope.flow_id,
                step_id: envelope.step_id.clone(),
                variables: envelope.variables.clone(),
                step_outputs: envelope.step_outputs.clone(),
            },
        };

        let url = format!("{}/execute", self.handle.base_url);
        let send = async {
            let response = self
                .handle
                .http
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| Error::Handler(format!("plugin {} unreachable: {e}", self.handle.id)))?;
            response
                .json::<ExecuteResponse>()
                .await
                .map_err(|e| Error::Handler(format!("plugin {} bad response: {e}", self.handle.id)))
        };

        let response = tokio::select! {
            _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        };

        for log in &response.logs {
            match log.level.as_str() {
                "error" => error!(plugin = %self.handle.id, "{}", log.message),
                "warn" => warn!(plugin = %self.handle.id, "{}", log.message),
                "debug" => debug!(plugin = %self.handle.id, "{}", log.message),
                _ => info!(plugin = %self.handle.id, "{}", log.message),
            }
        }

        if response.success {
            Ok(response.output.unwrap_or_default())
        } else {
            let (code, message) = match response.error {
                Some(body) => {
                    if let Some(details) = &body.details {
                        debug!(plugin = %self.handle.id, code = %body.code, %details, "Plugin error details");
                    }
                    (body.code, body.message)
                }
                None => (
                    "E_UNKNOWN".to_string(),
                    "plugin reported failure without an error body".to_string(),
                ),
            };
            Err(Error::Plugin { code, message })
        }
    }
}

fn copy_dir_all(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
