//! Plugin manifests and on-disk discovery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// File name every plugin directory must carry.
pub const MANIFEST_FILE: &str = "plugin.yaml";

/// Type tag marking a plugin as a guest-module plugin.
pub const WASM_TYPE: &str = "wasm";

/// Declared guest-module configuration inside a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmConfig {
    /// WASM binary file name, relative to the manifest directory.
    pub binary: String,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default, with = "humantime_serde::option")]
    pub exec_timeout: Option<Duration>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Immutable description of a plugin. Parsed once at load; never mutated
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub wasm: Option<WasmConfig>,
}

impl PluginManifest {
    pub fn from_yaml(content: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = serde_yaml::from_str(content)?;
        if manifest.name.is_empty() {
            return Err(PluginError::InvalidManifest("empty plugin name".into()));
        }
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn is_wasm(&self) -> bool {
        self.wasm.is_some()
    }

    /// Absolute path of the declared WASM binary, given the manifest dir.
    pub fn wasm_binary_path(&self, manifest_dir: &Path) -> Option<PathBuf> {
        self.wasm.as_ref().map(|w| manifest_dir.join(&w.binary))
    }
}

/// Scan plugin roots for installed plugins.
///
/// Every subdirectory holding a parseable `plugin.yaml` with a non-empty
/// name yields one entry. Malformed manifests are skipped with a warning.
/// Guest-module plugins must have their declared binary on disk, and get
/// the `wasm` type tag added when the manifest forgot it.
pub fn discover_plugins(roots: &[PathBuf]) -> Vec<(PathBuf, PluginManifest)> {
    let mut found = Vec::new();

    for root in roots {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "plugin root not readable");
                continue;
            }
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }

            let mut manifest = match PluginManifest::from_file(&manifest_path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(
                        path = %manifest_path.display(),
                        error = %e,
                        "skipping malformed plugin manifest"
                    );
                    continue;
                }
            };

            if let Some(binary) = manifest.wasm_binary_path(&dir) {
                if !binary.exists() {
                    tracing::warn!(
                        plugin = %manifest.name,
                        binary = %binary.display(),
                        "skipping plugin: declared wasm binary missing"
                    );
                    continue;
                }
                if !manifest.types.iter().any(|t| t == WASM_TYPE) {
                    manifest.types.push(WASM_TYPE.to_string());
                }
            }

            tracing::debug!(plugin = %manifest.name, dir = %dir.display(), "discovered plugin");
            found.push((dir, manifest));
        }
    }

    found
}
