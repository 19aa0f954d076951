//! Flow runs understood by the workflow (echoer) service.
//!
//! A flow run is a small text program:
//!
//! ```text
//! flow_run devops_1700000000000000000
//! step artifactory_ci_4f0c… => (SUCCESS->done | FAIL->done) {
//!     action = "artifactory_ci";
//!     args = (branch="main", retry_count=15);
//! };
//! flow_run_end
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Write;

/// Transitions of a step that ends the run whatever its outcome.
pub const DONE_ON_ANY_OUTCOME: [(&str, &str); 2] = [("SUCCESS", "done"), ("FAIL", "done")];

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub transitions: Vec<(String, String)>,
    pub action: String,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRun {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Body POSTed to the workflow endpoint.
#[derive(Serialize, Debug)]
pub struct FlowRunRequest<'a> {
    pub data: &'a str,
}

impl FlowRun {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: vec![],
        }
    }

    pub fn add_step(
        &mut self,
        name: impl Into<String>,
        transitions: &[(&str, &str)],
        action: impl Into<String>,
        args: Map<String, Value>,
    ) -> &mut Self {
        self.steps.push(Step {
            name: name.into(),
            transitions: transitions
                .iter()
                .map(|(outcome, next)| (outcome.to_string(), next.to_string()))
                .collect(),
            action: action.into(),
            args,
        });
        self
    }

    pub fn generate(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = writeln!(out, "flow_run {}", self.name);
        for step in &self.steps {
            let transitions = step
                .transitions
                .iter()
                .map(|(outcome, next)| format!("{outcome}->{next}"))
                .collect::<Vec<_>>()
                .join(" | ");
            let mut args: Vec<_> = step.args.iter().collect();
            args.sort_by(|a, b| a.0.cmp(b.0));
            let args = args
                .into_iter()
                .map(|(key, value)| format!("{key}={}", render_value(value)))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "step {} => ({transitions}) {{", step.name);
            let _ = writeln!(out, "    action = {};", quote(&step.action));
            let _ = writeln!(out, "    args = ({args});");
            let _ = writeln!(out, "}};");
        }
        out.push_str("flow_run_end\n");
        out
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => quote(""),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
