//! Renders the shell script the sandbox container runs.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::plan::Plan;

const TEMPLATE: &str = include_str!("../../templates/sandbox.sh.j2");

pub const WORKSPACE_DIR: &str = "/workspace";
pub const PLAN_PATH: &str = "/workspace/plan.json";
pub const SCRIPT_PATH: &str = "/workspace/sandbox.sh";
pub const STEP_RUNNER_PATH: &str = "/usr/local/bin/step-runner";

#[derive(Debug, Serialize)]
struct ScriptStep {
    id: String,
    action: String,
}

/// Script running every plan step through the step runner, dependencies
/// first, with progress markers around each step.
pub fn render_script(plan: &Plan) -> Result<String> {
    let mut env = Environment::new();
    env.add_filter("sh", shell_quote);
    env.add_template("sandbox.sh", TEMPLATE)
        .context("load sandbox script template")?;

    let steps: Vec<ScriptStep> = plan
        .sequenced_steps()
        .iter()
        .map(|seq| ScriptStep {
            id: seq.id(),
            action: seq.step.action.clone(),
        })
        .collect();

    let template = env
        .get_template("sandbox.sh")
        .context("get sandbox script template")?;
    let mut script = template
        .render(context! {
            steps => steps,
            runner => STEP_RUNNER_PATH,
            plan_path => PLAN_PATH,
        })
        .context("render sandbox script")?;
    script.push('\n');
    Ok(script)
}

/// Single-quote a value for POSIX sh.
fn shell_quote(value: String) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::plan::{DependencyNode, PLAN_FORMAT_VERSION, Platform, ResolvedStep};
    use crate::recipe::{Params, Recipe};

    fn step(action: &str) -> ResolvedStep {
        ResolvedStep {
            action: action.to_string(),
            params: Params::new(),
            install_deps: BTreeSet::new(),
            origin: action.to_string(),
            deterministic: true,
            requires_network: false,
        }
    }

    fn plan(tool: &str, steps: Vec<ResolvedStep>, dependencies: Vec<DependencyNode>) -> Plan {
        Plan {
            format_version: PLAN_FORMAT_VERSION,
            tool: tool.to_string(),
            ecosystem: Some("pypi".to_string()),
            version: "latest".to_string(),
            platform: Platform::new("linux", "amd64"),
            recipe_hash: String::new(),
            deterministic: false,
            steps,
            dependencies,
            missing: Vec::new(),
            verify: None,
        }
    }

    #[test]
    fn script_runs_dependencies_before_tool_steps() {
        let plan = plan(
            "ruff",
            vec![step("pip_exec")],
            vec![DependencyNode {
                name: "python-standalone".to_string(),
                recipe: Recipe::new("python-standalone", Vec::new()),
                steps: vec![step("download_file"), step("extract")],
                dependencies: Vec::new(),
            }],
        );

        let script = render_script(&plan).expect("render");
        let markers: Vec<&str> = script
            .lines()
            .filter(|line| line.starts_with("printf '@@step"))
            .collect();
        assert_eq!(
            markers,
            vec![
                "printf '@@step %s %s\\n' 'python-standalone#0' 'download_file'",
                "printf '@@step %s %s\\n' 'python-standalone#1' 'extract'",
                "printf '@@step %s %s\\n' 'ruff#0' 'pip_exec'",
            ]
        );
        assert!(script.contains(
            "/usr/local/bin/step-runner --plan /workspace/plan.json --step 'ruff#0'"
        ));
        assert!(script.trim_end().ends_with("echo '@@complete'"));
        assert!(script.starts_with("#!/bin/sh\n"));
    }

    #[test]
    fn tool_name_never_reaches_the_script_unquoted() {
        let script = render_script(&plan("x\nrm -rf /", Vec::new(), Vec::new())).expect("render");
        assert!(!script.contains("rm -rf"), "{script}");
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's".to_string()), r"'it'\''s'");
    }
}
