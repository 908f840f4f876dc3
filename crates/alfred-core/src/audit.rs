//! Audit event model.
//!
//! Every consequential action in the runtime is mirrored to an
//! [`AuditLogger`]. The concrete JSON-lines sink lives in
//! `alfred-security`; this module only defines the event shape and the
//! object-safe logging contract the rest of the workspace consumes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known audit kinds. The set is open: callers may log custom kinds.
pub mod kinds {
    pub const LLM_CALL: &str = "LLMCall";
    pub const TOOL_EXEC: &str = "ToolExec";
    pub const MEMORY_STORE: &str = "MemoryStore";
    pub const ACCESS_LOG: &str = "AccessLog";
    pub const DATA_EVENT: &str = "DataEvent";
    pub const GDPR_EXPORT: &str = "GDPRExport";
    pub const GDPR_DELETE: &str = "GDPRDelete";
    pub const GDPR_ANONYMIZE: &str = "GDPRAnonymize";
}

/// One audit record, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Filled with UTC now by the sink when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            kind: kind.into(),
            actor: String::new(),
            resource: String::new(),
            action: String::new(),
            outcome: String::new(),
            detail: BTreeMap::new(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Object-safe audit sink contract.
///
/// Write errors surface to the caller of `log` but must never unwind
/// workflow state; callers decide whether to propagate or warn.
pub trait AuditLogger: Send + Sync {
    fn log(&self, event: AuditEvent) -> Result<(), AuditError>;
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_fields() {
        let event = AuditEvent::new(kinds::TOOL_EXEC)
            .actor("workflow")
            .resource("echo")
            .action("exec")
            .outcome("success")
            .detail("step", "s1");

        assert_eq!(event.kind, "ToolExec");
        assert_eq!(event.actor, "workflow");
        assert_eq!(event.detail.get("step").map(String::as_str), Some("s1"));
        assert!(event.timestamp.is_none());
    }

    #[test]
    fn serializes_to_flat_json() {
        let event = AuditEvent::new(kinds::ACCESS_LOG).actor("cli").outcome("success");
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"kind\":\"AccessLog\""));
        assert!(!line.contains("detail"), "empty detail map is omitted");
    }
}
