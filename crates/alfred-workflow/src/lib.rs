//! Workflow engine for the Alfred agent runtime.
//!
//! Pipelines are linear YAML-declared step sequences with conditional
//! skipping and a single pausing point (human approval). The
//! [`WorkflowEngine`] dispatches each step to a typed executor, consults
//! the security sandboxes before any side effect, persists run state in
//! the [`WorkflowStore`], and mirrors every transition onto the event bus.

pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod template;
pub mod truncate;

pub use engine::{RunOptions, WorkflowEngine, WorkflowEngineBuilder};
pub use error::WorkflowError;
pub use model::{
    Pipeline, PipelineArg, RunStatus, Step, StepKind, StepResult, StepStatus, WorkflowRun,
};
pub use store::WorkflowStore;
