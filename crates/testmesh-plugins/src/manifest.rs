//! Plugin manifest parsing and validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::{PluginError, PluginResult};

/// Manifest file name expected in every plugin directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Declarative description of a plugin, read from `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier; also the action name the plugin serves.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Only `action` plugins are executable; the other types are reserved.
    #[serde(rename = "type", default)]
    pub plugin_type: PluginType,
    /// Path of the executable entry point, relative to the plugin directory.
    pub entry_point: String,
    /// Informational permission declarations.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Default configuration merged under the step config by the plugin.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Declared plugin kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    #[default]
    Action,
    Auth,
    Exporter,
    Importer,
    Reporter,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Action => "action",
            PluginType::Auth => "auth",
            PluginType::Exporter => "exporter",
            PluginType::Importer => "importer",
            PluginType::Reporter => "reporter",
        }
    }
}

impl PluginManifest {
    /// Read and validate the manifest inside `dir`.
    pub fn load(dir: &Path) -> PluginResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)?;
        let manifest: PluginManifest = serde_json::from_str(&content)
            .map_err(|e| PluginError::Manifest(format!("{}: {e}", path.display())))?;
        manifest.validate(dir)?;
        Ok(manifest)
    }

    /// Structural validation against the directory the manifest lives in.
    pub fn validate(&self, dir: &Path) -> PluginResult<()> {
        if self.id.trim().is_empty() {
            return Err(PluginError::Manifest("`id` must not be empty".into()));
        }
        if self
            .id
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(PluginError::Manifest(format!(
                "`id` may only contain alphanumerics, `-` and `_`: `{}`",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(PluginError::Manifest("`name` must not be empty".into()));
        }
        if self.entry_point.trim().is_empty() {
            return Err(PluginError::Manifest("`entry_point` must not be empty".into()));
        }
        let entry = dir.join(&self.entry_point);
        if !entry.is_file() {
            return Err(PluginError::Manifest(format!(
                "entry point `{}` does not exist under {}",
                self.entry_point,
                dir.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plugin(dir: &Path, manifest: &str, entry: &str) {
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        std::fs::write(dir.join(entry), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_load_valid_manifest() {
        let dir = TempDir::new().unwrap();
        write_plugin(
            dir.path(),
            r#"{ "id": "kafka", "name": "Kafka actions", "version": "1.0.0",
                 "type": "action", "entry_point": "main.py" }"#,
            "main.py",
        );

        let manifest = PluginManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.id, "kafka");
        assert_eq!(manifest.plugin_type, PluginType::Action);
        assert!(manifest.permissions.is_empty());
    }

    #[test]
    fn test_type_defaults_to_action() {
        let dir = TempDir::new().unwrap();
        write_plugin(
            dir.path(),
            r#"{ "id": "x", "name": "X", "entry_point": "run.sh" }"#,
            "run.sh",
        );
        let manifest = PluginManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.plugin_type, PluginType::Action);
    }

    #[test]
    fn test_missing_entry_point_file_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{ "id": "x", "name": "X", "entry_point": "gone.js" }"#,
        )
        .unwrap();

        let err = PluginManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::Manifest(m) if m.contains("gone.js")));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
        assert!(matches!(
            PluginManifest::load(dir.path()),
            Err(PluginError::Manifest(_))
        ));
    }

    #[test]
    fn test_id_charset_enforced() {
        let dir = TempDir::new().unwrap();
        write_plugin(
            dir.path(),
            r#"{ "id": "bad id!", "name": "X", "entry_point": "run.sh" }"#,
            "run.sh",
        );
        assert!(matches!(
            PluginManifest::load(dir.path()),
            Err(PluginError::Manifest(_))
        ));
    }
}
