use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already loaded: {0}")]
    Duplicate(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("permission denied: plugin {plugin:?} requests {permission:?}")]
    PermissionDenied { plugin: String, permission: String },

    #[error("plugin init timed out: {0}")]
    Timeout(String),

    #[error("init failed: {0}")]
    InitFailed(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("install failed: {0}")]
    Install(String),

    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Runtime(#[from] alfred_runtime::RuntimeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
