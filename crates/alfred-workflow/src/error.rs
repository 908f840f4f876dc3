use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("pipeline not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("run limit reached: {0} already running")]
    LimitReached(usize),

    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("workflow timed out: {0}")]
    Timeout(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Security(#[from] alfred_security::SecurityError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
