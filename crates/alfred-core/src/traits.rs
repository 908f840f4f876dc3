//! Collaborator contracts the core consumes.
//!
//! Memory adapters, tool registries, and shell executors live outside this
//! workspace; the core only depends on these traits. All of them are
//! object-safe and typically injected as `Arc<dyn …>` through constructors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{MemoryEntry, MemoryError};

/// Result of a memory curation pass over a message batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurateResult {
    pub stored: usize,
    pub skipped: usize,
}

/// Long-term memory backend.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> Result<(), MemoryError>;
    async fn query(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError>;
    async fn delete(&self, id: &str) -> Result<(), MemoryError>;
    async fn curate(&self, messages: &[String]) -> Result<CurateResult, MemoryError>;
    async fn sync(&self) -> Result<(), MemoryError>;
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Declared tool interface, surfaced to LLM clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool failed: {0}")]
    Failure(String),

    #[error("tool timed out: {0}")]
    Timeout(String),
}

/// A single invocable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;
    async fn execute(&self, params: serde_json::Value) -> Result<ToolResult, ToolError>;
}

/// Registry of available tools.
pub trait ToolExecutor: Send + Sync {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Tool>>;
    fn schemas(&self) -> Vec<ToolSchema>;
}

/// Captured output of a completed command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command not allowed: {0}")]
    NotAllowed(String),

    #[error("command failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shell command delegate. The core validates commands and working
/// directories before calling this; the executor owns process details.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        args: &[String],
        work_dir: &std::path::Path,
    ) -> Result<CommandOutput, ExecError>;
}
