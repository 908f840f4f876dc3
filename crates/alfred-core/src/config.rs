//! Host configuration, loaded from `alfred.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Default, Deserialize)]
pub struct AlfredConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Workflow engine limits and lookup paths.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    /// Directory scanned for pipeline YAML files.
    #[serde(default = "default_pipeline_dir")]
    pub pipeline_dir: PathBuf,
    /// Directory holding the run journal and consent records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Concurrent run ceiling; admission fails beyond it.
    #[serde(default = "default_max_running")]
    pub max_running: usize,
    /// Fallback run deadline when neither caller nor pipeline set one.
    #[serde(default = "default_workflow_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Ceiling on a single step's stored output, in bytes.
    #[serde(default = "default_max_output")]
    pub max_output: usize,
    /// Commands (by basename) exec steps may run.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Workflow-specific override for `allowed_commands`; wins when non-empty.
    #[serde(default)]
    pub workflow_allowed_commands: Vec<String>,
}

fn default_pipeline_dir() -> PathBuf {
    alfred_home().join("pipelines")
}
fn default_data_dir() -> PathBuf {
    alfred_home().join("data")
}
fn default_max_running() -> usize {
    4
}
fn default_workflow_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_max_output() -> usize {
    256 * 1024
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            pipeline_dir: default_pipeline_dir(),
            data_dir: default_data_dir(),
            max_running: default_max_running(),
            timeout: default_workflow_timeout(),
            max_output: default_max_output(),
            allowed_commands: Vec::new(),
            workflow_allowed_commands: Vec::new(),
        }
    }
}

/// Plugin roots, registry endpoint, and permission policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginsConfig {
    /// Directories scanned for installed plugins.
    #[serde(default = "default_plugin_roots")]
    pub roots: Vec<PathBuf>,
    /// Directory new plugins are installed into.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// When non-empty, only these permissions may be requested.
    #[serde(default)]
    pub allow_permissions: Vec<String>,
    /// Permissions rejected regardless of `allow_permissions`.
    #[serde(default)]
    pub deny_permissions: Vec<String>,
}

fn default_plugin_roots() -> Vec<PathBuf> {
    vec![alfred_home().join("plugins")]
}
fn default_install_dir() -> PathBuf {
    alfred_home().join("plugins")
}
fn default_registry_url() -> String {
    "https://registry.alfred.dev/index.json".into()
}
fn default_cache_dir() -> PathBuf {
    alfred_home().join("cache")
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            roots: default_plugin_roots(),
            install_dir: default_install_dir(),
            registry_url: default_registry_url(),
            cache_dir: default_cache_dir(),
            allow_permissions: Vec::new(),
            deny_permissions: Vec::new(),
        }
    }
}

/// Sandbox root, audit log location, and retention policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Filesystem root all workflow paths resolve against.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    /// Audit records older than this are dropped on retention sweeps.
    #[serde(default, with = "humantime_serde::option")]
    pub retention_max_age: Option<Duration>,
    /// Audit file size cap, e.g. "50MB". Empty means no limit.
    #[serde(default)]
    pub retention_max_size: String,
    /// Environment variable holding the content encryption passphrase.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
}

fn default_sandbox_root() -> PathBuf {
    alfred_home().join("workspace")
}
fn default_audit_log() -> PathBuf {
    alfred_home().join("data").join("audit.jsonl")
}
fn default_passphrase_env() -> String {
    "ALFRED_PASSPHRASE".into()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            audit_log: default_audit_log(),
            retention_max_age: None,
            retention_max_size: String::new(),
            passphrase_env: default_passphrase_env(),
        }
    }
}

fn alfred_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".alfred")
}

impl AlfredConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}
