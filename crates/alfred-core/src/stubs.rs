//! Scripted collaborator stand-ins for wiring and tests.
//!
//! Kept in the library (not behind `cfg(test)`) so downstream crates can
//! drive the engine without a real shell or tool registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::traits::{
    CommandExecutor, CommandOutput, ExecError, Tool, ToolError, ToolExecutor, ToolResult,
    ToolSchema,
};

/// Command executor that replays scripted outputs in call order and records
/// every invocation.
pub struct StubCommandExecutor {
    responses: Mutex<Vec<Result<CommandOutput, String>>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl StubCommandExecutor {
    /// Every call succeeds, echoing the command line to stdout.
    pub fn echoing() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replay the given results in order; panics in tests if exhausted.
    pub fn scripted(responses: Vec<Result<CommandOutput, String>>) -> Self {
        let mut responses = responses;
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for StubCommandExecutor {
    async fn execute(
        &self,
        command: &str,
        args: &[String],
        _work_dir: &Path,
    ) -> Result<CommandOutput, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), args.to_vec()));

        match self.responses.lock().unwrap().pop() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(ExecError::Failed(message)),
            None => Ok(CommandOutput {
                stdout: format!("{command} {}", args.join(" ")).trim_end().to_string(),
                stderr: String::new(),
            }),
        }
    }
}

/// Tool built from a closure, for registries assembled in tests.
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    #[allow(clippy::type_complexity)]
    handler: Box<dyn Fn(serde_json::Value) -> Result<ToolResult, ToolError> + Send + Sync>,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(serde_json::Value) -> Result<ToolResult, ToolError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema: serde_json::json!({"type": "object"}),
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolResult, ToolError> {
        (self.handler)(params)
    }
}

/// Fixed name → tool map.
#[derive(Default)]
pub struct StaticToolExecutor {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl StaticToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }
}

impl ToolExecutor for StaticToolExecutor {
    fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_executor_replays_in_order() {
        let exec = StubCommandExecutor::scripted(vec![
            Ok(CommandOutput {
                stdout: "first".into(),
                stderr: String::new(),
            }),
            Err("boom".into()),
        ]);

        let out = exec.execute("echo", &[], Path::new(".")).await.unwrap();
        assert_eq!(out.stdout, "first");

        let err = exec.execute("echo", &[], Path::new(".")).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed(m) if m == "boom"));
        assert_eq!(exec.calls().len(), 2);
    }

    #[tokio::test]
    async fn static_executor_resolves_tools() {
        let tool = Arc::new(FnTool::new("greet", |params| {
            Ok(ToolResult::ok(format!("hi {}", params["name"].as_str().unwrap_or("?"))))
        }));
        let registry = StaticToolExecutor::new().with_tool(tool);

        let got = registry.get("greet").expect("registered");
        let result = got
            .execute(serde_json::json!({"name": "ada"}))
            .await
            .unwrap();
        assert_eq!(result.content, "hi ada");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.schemas().len(), 1);
    }
}
