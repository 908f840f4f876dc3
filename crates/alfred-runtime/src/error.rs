use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("guest module not found: {0}")]
    ModuleNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid guest module: {0}")]
    InvalidModule(String),

    #[error("compilation failed: {0}")]
    CompilationFailed(String),

    #[error("instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("guest call timed out: {0}")]
    Timeout(String),

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
