//! Pipeline and run data model.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// Declared pipeline argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineArg {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A declarative, linear sequence of steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    /// Defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub args: BTreeMap<String, PipelineArg>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One pipeline step. The type tag selects the executor; type-specific
/// fields live in [`StepKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Template; a falsy trimmed result skips the step.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

/// Typed step payload. Modeling the type tag as an enum lets the loader
/// enforce the type/field cross-product instead of discovering a missing
/// field at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Exec {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        work_dir: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        fail_on_error: bool,
    },
    Transform {
        template: String,
    },
    Approval {
        message: String,
    },
    ToolCall {
        tool_name: String,
        #[serde(default)]
        params: Option<String>,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Exec { .. } => "exec",
            StepKind::Http { .. } => "http",
            StepKind::Transform { .. } => "transform",
            StepKind::Approval { .. } => "approval",
            StepKind::ToolCall { .. } => "tool_call",
        }
    }
}

impl Pipeline {
    /// Parse a pipeline from YAML; `fallback_name` is used when the file
    /// declares none.
    pub fn from_yaml(content: &str, fallback_name: &str) -> Result<Self, WorkflowError> {
        let mut pipeline: Pipeline = serde_yaml::from_str(content)?;
        if pipeline.name.is_empty() {
            pipeline.name = fallback_name.to_string();
        }
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, &stem)
    }

    /// Structural validation applied at load and at inline-run admission.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidInput(format!(
                "pipeline {:?} has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(WorkflowError::InvalidInput(format!(
                    "pipeline {:?}: step without id",
                    self.name
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::InvalidInput(format!(
                    "pipeline {:?}: duplicate step id {:?}",
                    self.name, step.id
                )));
            }

            let missing = match &step.kind {
                StepKind::Exec { command, .. } if command.is_empty() => Some("command"),
                StepKind::Http { url, .. } if url.is_empty() => Some("url"),
                StepKind::Transform { template } if template.is_empty() => Some("template"),
                StepKind::ToolCall { tool_name, .. } if tool_name.is_empty() => Some("tool_name"),
                _ => None,
            };
            if let Some(field) = missing {
                return Err(WorkflowError::InvalidInput(format!(
                    "pipeline {:?}: step {:?} ({}) is missing {field}",
                    self.name,
                    step.id,
                    step.kind.type_name()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Denied,
}

impl RunStatus {
    /// Terminal states are eligible for store eviction.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Denied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Structured output; a JSON string for text-producing steps.
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Persistent record of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// ULID: lexicographically sortable by creation instant.
    pub id: String,
    pub pipeline_name: String,
    /// Snapshot of the pipeline as admitted; later edits to the YAML do
    /// not affect a paused run.
    pub pipeline: Pipeline,
    /// Index of the next step to execute.
    pub current: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_output: usize,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub approval_message: Option<String>,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        pipeline: Pipeline,
        env: BTreeMap<String, String>,
        timeout: Duration,
        max_output: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            pipeline_name: pipeline.name.clone(),
            pipeline,
            current: 0,
            timeout,
            max_output,
            status: RunStatus::Running,
            steps: Vec::new(),
            env,
            approval_message: None,
            resume_token: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
