use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("sandbox init failed: {0}")]
    SandboxInit(String),

    #[error("path outside sandbox: {0}")]
    PathOutsideSandbox(String),

    #[error("request blocked: {0}")]
    SsrfBlocked(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("audit write failed: {0}")]
    AuditWrite(String),

    #[error("consent state error: {0}")]
    Consent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
