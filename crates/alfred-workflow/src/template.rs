//! Template evaluation over run state.
//!
//! Step fields (`condition`, transform templates, exec args, HTTP url/body/
//! headers, tool parameters) all render against the same data model:
//! `{ <step_id>: {status, error, output}, args: {<name>: <value>} }` where
//! `output` is the JSON-decoded step output when decodable and the raw
//! string otherwise.
//!
//! Rendering is a pure function of `(text, data)`; a fresh environment is
//! built per evaluation and nothing is memoized across runs.

use minijinja::Environment;

use crate::error::WorkflowError;
use crate::model::{StepStatus, WorkflowRun};

/// Build the template data for a run's current state.
pub fn template_data(run: &WorkflowRun) -> serde_json::Value {
    let mut root = serde_json::Map::new();

    for result in &run.steps {
        let output = match &result.output {
            serde_json::Value::String(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| result.output.clone())
            }
            other => other.clone(),
        };
        root.insert(
            result.step_id.clone(),
            serde_json::json!({
                "status": status_str(result.status),
                "error": result.error,
                "output": output,
            }),
        );
    }

    let args: serde_json::Map<String, serde_json::Value> = run
        .env
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    root.insert("args".into(), serde_json::Value::Object(args));

    serde_json::Value::Object(root)
}

fn status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

/// Render `text` against `data`.
pub fn render(text: &str, data: &serde_json::Value) -> Result<String, WorkflowError> {
    let mut env = Environment::new();
    // Conditions routinely probe steps that have not run yet; chainable
    // undefined lets `{{ later.status }}` render empty instead of erroring.
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Chainable);
    env.render_str(text, data)
        .map_err(|e| WorkflowError::Template(format!("{e:#}")))
}

/// Condition truthiness: the trimmed rendering is truthy unless empty,
/// `"false"`, `"0"`, or `"none"` (an undefined or none value printed).
pub fn is_truthy(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    !(trimmed.is_empty() || trimmed == "false" || trimmed == "0" || trimmed == "none")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Pipeline, StepResult};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn run_with_results() -> WorkflowRun {
        let mut env = BTreeMap::new();
        env.insert("tag".to_string(), "v1.2.3".to_string());

        let mut run = WorkflowRun::new(
            Pipeline {
                name: "p".into(),
                ..Default::default()
            },
            env,
            Duration::from_secs(60),
            4096,
        );
        run.steps.push(StepResult {
            step_id: "build".into(),
            status: StepStatus::Completed,
            output: serde_json::Value::String(r#"{"artifact":"out.tar.gz"}"#.into()),
            error: None,
            duration_ms: 12,
        });
        run.steps.push(StepResult {
            step_id: "lint".into(),
            status: StepStatus::Failed,
            output: serde_json::Value::String("plain text output".into()),
            error: Some("lint failed".into()),
            duration_ms: 3,
        });
        run
    }

    #[test]
    fn data_decodes_json_outputs() {
        let data = template_data(&run_with_results());
        assert_eq!(data["build"]["status"], "completed");
        assert_eq!(data["build"]["output"]["artifact"], "out.tar.gz");
        // Non-JSON output stays a raw string.
        assert_eq!(data["lint"]["output"], "plain text output");
        assert_eq!(data["lint"]["error"], "lint failed");
        assert_eq!(data["args"]["tag"], "v1.2.3");
    }

    #[test]
    fn renders_step_and_arg_references() {
        let data = template_data(&run_with_results());
        let out = render("artifact={{ build.output.artifact }} tag={{ args.tag }}", &data).unwrap();
        assert_eq!(out, "artifact=out.tar.gz tag=v1.2.3");
    }

    #[test]
    fn renders_conditionals() {
        let data = template_data(&run_with_results());
        let yes = render(
            "{% if lint.status == \"failed\" %}true{% endif %}",
            &data,
        )
        .unwrap();
        assert!(is_truthy(&yes));

        let no = render(
            "{% if build.status == \"failed\" %}true{% endif %}",
            &data,
        )
        .unwrap();
        assert!(!is_truthy(&no));
    }

    #[test]
    fn render_error_surfaces() {
        let data = template_data(&run_with_results());
        let err = render("{% if %}", &data).unwrap_err();
        assert!(matches!(err, WorkflowError::Template(_)));
    }

    #[test]
    fn truthiness_rules() {
        assert!(is_truthy("yes"));
        assert!(is_truthy("  1  "));
        assert!(!is_truthy(""));
        assert!(!is_truthy("   "));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("none"));
    }

    #[test]
    fn undefined_reference_renders_falsy() {
        let data = template_data(&run_with_results());
        // Lenient undefined: printing an unknown name yields empty.
        let out = render("{{ nosuchstep.status }}", &data).unwrap();
        assert!(!is_truthy(&out));
    }
}
