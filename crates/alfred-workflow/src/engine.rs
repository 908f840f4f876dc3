//! Pipeline scheduling and typed step dispatch.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use alfred_core::audit::{AuditEvent, AuditLogger, kinds as audit_kinds};
use alfred_core::config::WorkflowConfig;
use alfred_core::events::{BusEvent, EventBus, kinds as event_kinds};
use alfred_core::traits::{CommandExecutor, ToolExecutor};
use alfred_security::{NetworkSandbox, PathSandbox, SafeResolver};

use crate::error::WorkflowError;
use crate::model::{
    Pipeline, RunStatus, Step, StepKind, StepResult, StepStatus, WorkflowRun,
};
use crate::store::WorkflowStore;
use crate::template::{is_truthy, render, template_data};
use crate::truncate::truncate_output;

/// HTTP methods an `http` step may use.
const HTTP_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];

/// Tool name reserved to prevent a workflow step from invoking workflows.
const RESERVED_TOOL: &str = "workflow";

/// Fallback HTTP body cap when no output ceiling is configured.
const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Caller overrides for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub max_output: Option<usize>,
}

/// Assembles a [`WorkflowEngine`] with its injected collaborators.
pub struct WorkflowEngineBuilder {
    config: WorkflowConfig,
    store: Arc<WorkflowStore>,
    bus: Arc<dyn EventBus>,
    executor: Arc<dyn CommandExecutor>,
    paths: Arc<PathSandbox>,
    network: Arc<NetworkSandbox>,
    tools: Option<Arc<dyn ToolExecutor>>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl WorkflowEngineBuilder {
    pub fn new(
        config: WorkflowConfig,
        store: Arc<WorkflowStore>,
        bus: Arc<dyn EventBus>,
        executor: Arc<dyn CommandExecutor>,
        paths: Arc<PathSandbox>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            executor,
            paths,
            network: Arc::new(NetworkSandbox::new()),
            tools: None,
            audit: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_network(mut self, network: Arc<NetworkSandbox>) -> Self {
        self.network = network;
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, WorkflowError> {
        // All engine HTTP dials resolve through the sandbox, so a DNS
        // answer that changes after validation still cannot reach a
        // forbidden address.
        let http = SafeResolver::client(Arc::clone(&self.network))
            .map_err(|e| WorkflowError::InvalidInput(format!("http client: {e}")))?;
        Ok(WorkflowEngine {
            config: self.config,
            store: self.store,
            bus: self.bus,
            executor: self.executor,
            paths: self.paths,
            network: self.network,
            tools: self.tools,
            audit: self.audit,
            http,
            pipelines: RwLock::new(HashMap::new()),
            running: AtomicUsize::new(0),
        })
    }
}

/// Executes pipelines: admission, env resolution, step dispatch,
/// pause/resume, persistence, and event publication.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    store: Arc<WorkflowStore>,
    bus: Arc<dyn EventBus>,
    executor: Arc<dyn CommandExecutor>,
    paths: Arc<PathSandbox>,
    network: Arc<NetworkSandbox>,
    tools: Option<Arc<dyn ToolExecutor>>,
    audit: Option<Arc<dyn AuditLogger>>,
    http: reqwest::Client,
    pipelines: RwLock<HashMap<String, Pipeline>>,
    running: AtomicUsize,
}

enum StepOutcome {
    Done(StepResult),
    Pause {
        result: StepResult,
        token: String,
        message: String,
    },
}

enum LoopOutcome {
    Finished,
    Paused,
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkflowEngine {
    /// Scan the configured pipeline directory for YAML pipelines. Invalid
    /// files are skipped with a warning and never become runnable.
    pub async fn load_pipelines(&self) -> Result<usize, WorkflowError> {
        let dir = self.config.pipeline_dir.clone();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %dir.display(), "pipeline directory absent");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        let mut pipelines = self.pipelines.write().await;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            match Pipeline::from_file(&path) {
                Ok(pipeline) => {
                    tracing::debug!(pipeline = %pipeline.name, path = %path.display(), "pipeline loaded");
                    pipelines.insert(pipeline.name.clone(), pipeline);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid pipeline");
                }
            }
        }
        tracing::info!(count = loaded, dir = %dir.display(), "pipelines loaded");
        Ok(loaded)
    }

    /// Register a pipeline directly (embedding and tests).
    pub async fn add_pipeline(&self, pipeline: Pipeline) -> Result<(), WorkflowError> {
        pipeline.validate()?;
        self.pipelines
            .write()
            .await
            .insert(pipeline.name.clone(), pipeline);
        Ok(())
    }

    pub async fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_run(&self, id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.store.get_run(id).await
    }

    pub async fn list_runs(&self, limit: usize) -> Vec<WorkflowRun> {
        self.store.list_runs(limit).await
    }

    /// Run a loaded pipeline by name.
    pub async fn run(
        &self,
        name: &str,
        env: BTreeMap<String, String>,
        opts: RunOptions,
    ) -> Result<WorkflowRun, WorkflowError> {
        let pipeline = self
            .pipelines
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?;
        self.run_inline(pipeline, env, opts).await
    }

    /// Validate and run a pipeline supplied by the caller.
    pub async fn run_inline(
        &self,
        pipeline: Pipeline,
        env: BTreeMap<String, String>,
        opts: RunOptions,
    ) -> Result<WorkflowRun, WorkflowError> {
        pipeline.validate()?;

        let max = self.config.max_running.max(1);
        let mut current = self.running.load(Ordering::SeqCst);
        loop {
            if current >= max {
                return Err(WorkflowError::LimitReached(current));
            }
            match self.running.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let _guard = RunningGuard(&self.running);

        let merged = self.resolve_env(&pipeline, env)?;
        let timeout = effective_timeout(opts.timeout, pipeline.timeout, self.config.timeout);
        let max_output = match opts.max_output {
            Some(requested) if requested > 0 && requested < self.config.max_output => requested,
            _ => self.config.max_output,
        };

        let run = WorkflowRun::new(pipeline, merged, timeout, max_output);
        self.store.save_run(&run).await?;
        self.publish(
            event_kinds::WORKFLOW_STARTED,
            serde_json::json!({ "run_id": run.id, "pipeline": run.pipeline_name }),
        );
        tracing::info!(run = %run.id, pipeline = %run.pipeline_name, "workflow started");

        self.execute_run(run).await
    }

    /// Resume a paused run by token. `approve = false` denies it.
    pub async fn resume(
        &self,
        token: &str,
        approve: bool,
    ) -> Result<WorkflowRun, WorkflowError> {
        let mut run = self.store.get_run_by_token(token).await?;
        if run.status != RunStatus::Paused {
            return Err(WorkflowError::InvalidInput(format!(
                "run {} is not paused",
                run.id
            )));
        }

        if !approve {
            run.status = RunStatus::Denied;
            run.resume_token = None;
            run.touch();
            self.store.save_run(&run).await?;
            tracing::info!(run = %run.id, "workflow denied");
            return Ok(run);
        }

        run.resume_token = None;
        run.approval_message = None;
        run.status = RunStatus::Running;
        run.current += 1;
        run.touch();
        self.store.save_run(&run).await?;
        self.publish(
            event_kinds::WORKFLOW_RESUMED,
            serde_json::json!({ "run_id": run.id, "pipeline": run.pipeline_name }),
        );
        tracing::info!(run = %run.id, step = run.current, "workflow resumed");

        self.execute_run(run).await
    }

    /// Merge env sources (later wins), then enforce required args.
    fn resolve_env(
        &self,
        pipeline: &Pipeline,
        caller: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, WorkflowError> {
        let mut merged = BTreeMap::new();
        for (name, arg) in &pipeline.args {
            if let Some(default) = &arg.default {
                merged.insert(name.clone(), default.clone());
            }
        }
        for (k, v) in &pipeline.env {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in caller {
            merged.insert(k, v);
        }

        for (name, arg) in &pipeline.args {
            if arg.required && !merged.contains_key(name) {
                return Err(WorkflowError::InvalidInput(format!(
                    "required arg {name:?} not provided"
                )));
            }
        }
        Ok(merged)
    }

    async fn execute_run(&self, mut run: WorkflowRun) -> Result<WorkflowRun, WorkflowError> {
        let budget = run.timeout;
        match tokio::time::timeout(budget, self.step_loop(&mut run)).await {
            Ok(Ok(LoopOutcome::Paused)) => {
                self.publish(
                    event_kinds::WORKFLOW_PAUSED,
                    serde_json::json!({
                        "run_id": run.id,
                        "pipeline": run.pipeline_name,
                        "resume_token": run.resume_token,
                        "message": run.approval_message,
                    }),
                );
                tracing::info!(run = %run.id, "workflow paused for approval");
                Ok(run)
            }
            Ok(Ok(LoopOutcome::Finished)) => {
                let failed = run
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Failed)
                    .cloned();
                match failed {
                    Some(step) => {
                        run.status = RunStatus::Failed;
                        run.error = Some(
                            step.error
                                .unwrap_or_else(|| format!("step {:?} failed", step.step_id)),
                        );
                    }
                    None => run.status = RunStatus::Completed,
                }
                run.touch();
                self.store.save_run(&run).await?;
                self.finish_events(&run);
                Ok(run)
            }
            Ok(Err(e)) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
                run.touch();
                self.store.save_run(&run).await?;
                self.finish_events(&run);
                Ok(run)
            }
            Err(_) => {
                run.status = RunStatus::Failed;
                run.error = Some(format!("workflow timed out after {budget:?}"));
                run.touch();
                self.store.save_run(&run).await?;
                self.finish_events(&run);
                Ok(run)
            }
        }
    }

    fn finish_events(&self, run: &WorkflowRun) {
        let (kind, error) = match run.status {
            RunStatus::Completed => (event_kinds::WORKFLOW_COMPLETED, None),
            _ => (event_kinds::WORKFLOW_FAILED, run.error.clone()),
        };
        self.publish(
            kind,
            serde_json::json!({
                "run_id": run.id,
                "pipeline": run.pipeline_name,
                "error": error,
            }),
        );
        match run.status {
            RunStatus::Completed => {
                tracing::info!(run = %run.id, steps = run.steps.len(), "workflow completed")
            }
            _ => tracing::warn!(run = %run.id, error = ?run.error, "workflow failed"),
        }
    }

    async fn step_loop(&self, run: &mut WorkflowRun) -> Result<LoopOutcome, WorkflowError> {
        while run.current < run.pipeline.steps.len() {
            let step = run.pipeline.steps[run.current].clone();

            if let Some(condition) = step.condition.as_deref() {
                if !condition.trim().is_empty() {
                    let data = template_data(run);
                    let skip_result = match render(condition, &data) {
                        Ok(rendered) if !is_truthy(&rendered) => Some(StepResult {
                            step_id: step.id.clone(),
                            status: StepStatus::Skipped,
                            output: serde_json::Value::Null,
                            error: None,
                            duration_ms: 0,
                        }),
                        Ok(_) => None,
                        Err(e) => Some(StepResult {
                            step_id: step.id.clone(),
                            status: StepStatus::Failed,
                            output: serde_json::Value::Null,
                            error: Some(format!("condition: {e}")),
                            duration_ms: 0,
                        }),
                    };
                    if let Some(result) = skip_result {
                        tracing::debug!(run = %run.id, step = %step.id, status = ?result.status, "condition gated step");
                        self.record_step(run, result).await?;
                        continue;
                    }
                }
            }

            let step_timeout = match step.timeout {
                Some(t) if !t.is_zero() && t < run.timeout => t,
                _ => run.timeout,
            };
            let data = template_data(run);
            let started = Instant::now();

            let outcome = match tokio::time::timeout(
                step_timeout,
                self.dispatch(&step, &data, run.max_output),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Done(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Failed,
                    output: serde_json::Value::Null,
                    error: Some(format!("step timed out after {step_timeout:?}")),
                    duration_ms: started.elapsed().as_millis() as u64,
                }),
            };

            match outcome {
                StepOutcome::Done(mut result) => {
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    self.record_step(run, result).await?;
                }
                StepOutcome::Pause {
                    mut result,
                    token,
                    message,
                } => {
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    self.audit_step(&run.id, &result);
                    run.steps.push(result);
                    run.status = RunStatus::Paused;
                    run.resume_token = Some(token);
                    run.approval_message = Some(message);
                    run.touch();
                    self.store.save_run(run).await?;
                    return Ok(LoopOutcome::Paused);
                }
            }
        }
        Ok(LoopOutcome::Finished)
    }

    async fn record_step(
        &self,
        run: &mut WorkflowRun,
        result: StepResult,
    ) -> Result<(), WorkflowError> {
        tracing::debug!(
            run = %run.id,
            step = %result.step_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "step finished"
        );
        self.audit_step(&run.id, &result);
        run.steps.push(result);
        run.current += 1;
        run.touch();
        self.store.save_run(run).await
    }

    fn audit_step(&self, run_id: &str, result: &StepResult) {
        let Some(audit) = &self.audit else { return };
        let outcome = match result.status {
            StepStatus::Completed => "success",
            StepStatus::Failed => "failure",
            StepStatus::Skipped => "skipped",
        };
        let event = AuditEvent::new(audit_kinds::TOOL_EXEC)
            .actor("workflow")
            .resource(&result.step_id)
            .action("step")
            .outcome(outcome)
            .detail("run_id", run_id);
        if let Err(e) = audit.log(event) {
            tracing::warn!(error = %e, "step audit event not recorded");
        }
    }

    fn publish(&self, kind: &str, payload: serde_json::Value) {
        self.bus.publish(BusEvent::new(kind, payload));
    }

    async fn dispatch(
        &self,
        step: &Step,
        data: &serde_json::Value,
        max_output: usize,
    ) -> StepOutcome {
        let done = |status: StepStatus, output: serde_json::Value, error: Option<String>| {
            StepOutcome::Done(StepResult {
                step_id: step.id.clone(),
                status,
                output,
                error,
                duration_ms: 0,
            })
        };
        let failed =
            |error: String| done(StepStatus::Failed, serde_json::Value::Null, Some(error));

        match &step.kind {
            StepKind::Exec {
                command,
                args,
                work_dir,
            } => {
                self.exec_step(step, command, args, work_dir.as_deref(), data, max_output)
                    .await
            }
            StepKind::Http {
                url,
                method,
                body,
                headers,
                fail_on_error,
            } => {
                self.http_step(
                    step,
                    url,
                    method.as_deref(),
                    body.as_deref(),
                    headers,
                    *fail_on_error,
                    data,
                    max_output,
                )
                .await
            }
            StepKind::Transform { template } => match render(template, data) {
                Ok(output) => done(
                    StepStatus::Completed,
                    serde_json::Value::String(truncate_output(&output, max_output)),
                    None,
                ),
                Err(e) => failed(format!("transform: {e}")),
            },
            StepKind::Approval { message } => {
                let message = match render(message, data) {
                    Ok(m) => m,
                    Err(e) => return failed(format!("approval message: {e}")),
                };
                let token = ulid::Ulid::new().to_string();
                StepOutcome::Pause {
                    result: StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Completed,
                        output: serde_json::json!({
                            "resume_token": token,
                            "message": message,
                        }),
                        error: None,
                        duration_ms: 0,
                    },
                    token,
                    message,
                }
            }
            StepKind::ToolCall { tool_name, params } => {
                self.tool_step(step, tool_name, params.as_deref(), data, max_output)
                    .await
            }
        }
    }

    async fn exec_step(
        &self,
        step: &Step,
        command: &str,
        args: &[String],
        work_dir: Option<&str>,
        data: &serde_json::Value,
        max_output: usize,
    ) -> StepOutcome {
        let failed = |error: String| {
            StepOutcome::Done(StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                output: serde_json::Value::Null,
                error: Some(error),
                duration_ms: 0,
            })
        };

        let allowed = if !self.config.workflow_allowed_commands.is_empty() {
            &self.config.workflow_allowed_commands
        } else {
            &self.config.allowed_commands
        };
        let basename = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !allowed.iter().any(|a| *a == basename) {
            return failed(
                WorkflowError::CommandNotAllowed(command.to_string()).to_string(),
            );
        }

        let work_dir = match work_dir {
            Some(raw) => {
                let rendered = match render(raw, data) {
                    Ok(r) => r,
                    Err(e) => return failed(format!("work_dir: {e}")),
                };
                match self.paths.validate(&rendered) {
                    Ok(validated) => validated,
                    Err(e) => return failed(e.to_string()),
                }
            }
            None => self.paths.root().to_path_buf(),
        };

        let mut rendered_args = Vec::with_capacity(args.len());
        for arg in args {
            match render(arg, data) {
                Ok(r) => rendered_args.push(r),
                Err(e) => return failed(format!("arg template: {e}")),
            }
        }

        match self
            .executor
            .execute(command, &rendered_args, &work_dir)
            .await
        {
            Ok(output) => {
                let mut combined = output.stdout;
                if !output.stderr.is_empty() {
                    combined.push_str("\nSTDERR:\n");
                    combined.push_str(&output.stderr);
                }
                StepOutcome::Done(StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Completed,
                    output: serde_json::Value::String(truncate_output(&combined, max_output)),
                    error: None,
                    duration_ms: 0,
                })
            }
            Err(e) => failed(e.to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn http_step(
        &self,
        step: &Step,
        url: &str,
        method: Option<&str>,
        body: Option<&str>,
        headers: &BTreeMap<String, String>,
        fail_on_error: bool,
        data: &serde_json::Value,
        max_output: usize,
    ) -> StepOutcome {
        let failed = |error: String, output: serde_json::Value| {
            StepOutcome::Done(StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                output,
                error: Some(error),
                duration_ms: 0,
            })
        };

        let url = match render(url, data) {
            Ok(u) => u,
            Err(e) => return failed(format!("url: {e}"), serde_json::Value::Null),
        };

        let method = method.unwrap_or("GET").to_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            return failed(
                format!("method {method:?} is not allowed"),
                serde_json::Value::Null,
            );
        }

        if let Err(e) = self.network.validate_url(&url).await {
            return failed(e.to_string(), serde_json::Value::Null);
        }

        let method = reqwest::Method::from_bytes(method.as_bytes()).expect("validated method");
        let mut request = self.http.request(method, &url);
        for (name, value) in headers {
            match render(value, data) {
                Ok(rendered) => request = request.header(name.as_str(), rendered),
                Err(e) => {
                    return failed(
                        format!("header {name}: {e}"),
                        serde_json::Value::Null,
                    );
                }
            }
        }
        if let Some(body) = body {
            match render(body, data) {
                Ok(rendered) => request = request.body(rendered),
                Err(e) => return failed(format!("body: {e}"), serde_json::Value::Null),
            }
        }

        let mut response = match request.send().await {
            Ok(r) => r,
            Err(e) => return failed(format!("request failed: {e}"), serde_json::Value::Null),
        };

        let status = response.status();
        let limit = if max_output > 0 {
            max_output
        } else {
            DEFAULT_BODY_LIMIT
        };
        let mut raw = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = limit.saturating_sub(raw.len());
                    if remaining == 0 {
                        break;
                    }
                    let take = remaining.min(chunk.len());
                    raw.extend_from_slice(&chunk[..take]);
                    if take < chunk.len() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return failed(format!("reading body: {e}"), serde_json::Value::Null);
                }
            }
        }

        let envelope = serde_json::json!({
            "status": status.as_u16(),
            "status_text": status.canonical_reason().unwrap_or(""),
            "body": String::from_utf8_lossy(&raw).into_owned(),
        });

        if fail_on_error && status.as_u16() >= 400 {
            return failed(format!("HTTP {}", status.as_u16()), envelope);
        }

        StepOutcome::Done(StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Completed,
            output: envelope,
            error: None,
            duration_ms: 0,
        })
    }

    async fn tool_step(
        &self,
        step: &Step,
        tool_name: &str,
        params: Option<&str>,
        data: &serde_json::Value,
        max_output: usize,
    ) -> StepOutcome {
        let failed = |error: String, output: serde_json::Value| {
            StepOutcome::Done(StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                output,
                error: Some(error),
                duration_ms: 0,
            })
        };

        let Some(tools) = &self.tools else {
            return failed("no tool executor configured".into(), serde_json::Value::Null);
        };
        if tool_name == RESERVED_TOOL {
            return failed(
                format!("tool {RESERVED_TOOL:?} is reserved: recursive workflow invocation"),
                serde_json::Value::Null,
            );
        }
        let Some(tool) = tools.get(tool_name) else {
            return failed(format!("tool not found: {tool_name}"), serde_json::Value::Null);
        };

        let raw_params = params.unwrap_or("{}");
        let rendered = match render(raw_params, data) {
            Ok(r) => r,
            Err(e) => return failed(format!("params: {e}"), serde_json::Value::Null),
        };
        let value: serde_json::Value = match serde_json::from_str(&rendered) {
            Ok(v) => v,
            Err(e) => {
                return failed(
                    format!("invalid tool parameters: {e}"),
                    serde_json::Value::String(rendered),
                );
            }
        };

        match tool.execute(value).await {
            Ok(result) if result.is_error => failed(
                result.content.clone(),
                serde_json::Value::String(result.content),
            ),
            Ok(result) => StepOutcome::Done(StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Completed,
                output: serde_json::Value::String(truncate_output(
                    &result.content,
                    max_output,
                )),
                error: None,
                duration_ms: 0,
            }),
            Err(e) => failed(e.to_string(), serde_json::Value::Null),
        }
    }
}

/// Smallest non-zero of caller, pipeline, and config timeouts; the config
/// value applies when nothing narrower is set.
fn effective_timeout(
    caller: Option<Duration>,
    pipeline: Option<Duration>,
    config: Duration,
) -> Duration {
    [caller, pipeline, Some(config)]
        .into_iter()
        .flatten()
        .filter(|t| !t.is_zero())
        .min()
        .unwrap_or(config)
}
