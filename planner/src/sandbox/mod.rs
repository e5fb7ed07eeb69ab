//! Sandbox executor: runs a complete plan inside an isolated container.
//!
//! The executor walks `NotStarted -> RuntimeDetection -> {Skipped | Running}
//! -> {Succeeded | Failed}`. Incomplete plans fail before detection. A host
//! without a container runtime (or without a configured step runner) skips
//! validation instead of failing it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::io::config::SandboxConfig;
use crate::io::plan_store::write_plan;
use crate::io::process::RunControl;
use crate::io::runtime::{
    ContainerRuntime, ContainerSpec, Mount, ResourceLimits, RunOutput, RuntimeDetector,
};
use crate::plan::Plan;

mod requirements;
mod script;

pub use requirements::{
    BUILD_IMAGE, DEFAULT_IMAGE, SandboxRequirements, build_limits, default_limits,
};
pub use script::{PLAN_PATH, SCRIPT_PATH, STEP_RUNNER_PATH, WORKSPACE_DIR, render_script};

/// Step id reported when the script fails before its first step marker.
pub const SETUP_STEP: &str = "setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    NotStarted,
    RuntimeDetection,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxFailure {
    #[error("plan incomplete: missing install-time dependencies: {}", .missing.join(", "))]
    PlanIncomplete { missing: Vec<String> },
    #[error("step {step_id} failed (exit code {})", exit_code_label(.exit_code))]
    StepFailed {
        step_id: String,
        exit_code: Option<i32>,
        output: String,
    },
    #[error("sandbox run cancelled{}", step_suffix(.step_id))]
    Cancelled { step_id: Option<String> },
    #[error("sandbox run timed out after {timeout_secs}s{}", step_suffix(.step_id))]
    TimedOut {
        step_id: Option<String>,
        timeout_secs: u64,
    },
    #[error("sandbox environment error: {message}")]
    Environment { message: String },
}

impl SandboxFailure {
    /// Id of the step the failure is attributed to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            SandboxFailure::StepFailed { step_id, .. } => Some(step_id),
            SandboxFailure::Cancelled { step_id } | SandboxFailure::TimedOut { step_id, .. } => {
                step_id.as_deref()
            }
            SandboxFailure::PlanIncomplete { .. } | SandboxFailure::Environment { .. } => None,
        }
    }

    fn environment(message: impl Into<String>) -> Self {
        SandboxFailure::Environment {
            message: message.into(),
        }
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |code| code.to_string())
}

fn step_suffix(step_id: &Option<String>) -> String {
    step_id
        .as_ref()
        .map(|id| format!(" during step {id}"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutcome {
    Succeeded,
    /// Validation could not run; not an error.
    Skipped { reason: String },
    Failed(SandboxFailure),
}

impl SandboxOutcome {
    /// Succeeded or skipped.
    pub fn is_ok(&self) -> bool {
        !matches!(self, SandboxOutcome::Failed(_))
    }

    pub fn failure(&self) -> Option<&SandboxFailure> {
        match self {
            SandboxOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for SandboxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxOutcome::Succeeded => f.write_str("succeeded"),
            SandboxOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            SandboxOutcome::Failed(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// Outcome plus every state the run passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRun {
    pub outcome: SandboxOutcome,
    pub states: Vec<SandboxState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSettings {
    pub step_runner: Option<PathBuf>,
    pub output_limit_bytes: usize,
    /// Replaces the timeout derived from the plan.
    pub timeout_override: Option<Duration>,
}

impl SandboxSettings {
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            step_runner: cfg.step_runner.clone(),
            output_limit_bytes: cfg.output_limit_bytes,
            timeout_override: cfg.timeout_override(),
        }
    }
}

pub struct SandboxExecutor<D> {
    detector: D,
    settings: SandboxSettings,
}

impl<D: RuntimeDetector> SandboxExecutor<D> {
    pub fn new(detector: D, settings: SandboxSettings) -> Self {
        Self { detector, settings }
    }

    pub fn validate(&self, plan: &Plan, control: &RunControl) -> SandboxOutcome {
        self.run(plan, control).outcome
    }

    #[instrument(skip_all, fields(tool = %plan.tool, platform = %plan.platform))]
    pub fn run(&self, plan: &Plan, control: &RunControl) -> SandboxRun {
        let mut states = vec![SandboxState::NotStarted];

        let missing = plan.missing_install_deps();
        if !missing.is_empty() {
            warn!(missing = ?missing, "refusing incomplete plan");
            states.push(SandboxState::Failed);
            return SandboxRun {
                outcome: SandboxOutcome::Failed(SandboxFailure::PlanIncomplete { missing }),
                states,
            };
        }

        states.push(SandboxState::RuntimeDetection);
        let Some(runtime) = self.detector.detect() else {
            return skipped(states, "no container runtime available");
        };
        let runner = match self.step_runner() {
            Ok(runner) => runner,
            Err(reason) => return skipped(states, reason),
        };

        states.push(SandboxState::Running);
        let outcome = match self.execute(runtime.as_ref(), plan, &runner, control) {
            Ok(()) => {
                info!(runtime = runtime.name(), "sandbox validation succeeded");
                states.push(SandboxState::Succeeded);
                SandboxOutcome::Succeeded
            }
            Err(failure) => {
                warn!(runtime = runtime.name(), err = %failure, "sandbox validation failed");
                states.push(SandboxState::Failed);
                SandboxOutcome::Failed(failure)
            }
        };
        SandboxRun { outcome, states }
    }

    fn step_runner(&self) -> Result<PathBuf, String> {
        match &self.settings.step_runner {
            None => Err("no step runner configured (sandbox.step_runner)".to_string()),
            Some(path) if !path.is_file() => {
                Err(format!("step runner {} not found", path.display()))
            }
            Some(path) => Ok(path.clone()),
        }
    }

    fn execute(
        &self,
        runtime: &dyn ContainerRuntime,
        plan: &Plan,
        runner: &Path,
        control: &RunControl,
    ) -> Result<(), SandboxFailure> {
        let reqs = SandboxRequirements::from_plan(plan);
        let timeout = self.settings.timeout_override.unwrap_or(reqs.limits.timeout);
        if control.cancel.is_cancelled() {
            return Err(SandboxFailure::Cancelled { step_id: None });
        }
        if control.remaining().is_some_and(|left| left.is_zero()) {
            return Err(SandboxFailure::TimedOut {
                step_id: None,
                timeout_secs: timeout.as_secs(),
            });
        }
        let control = control.tightened(timeout);
        let effective = control.remaining().unwrap_or(timeout);

        let workspace = tempfile::Builder::new()
            .prefix("planner-sandbox-")
            .tempdir()
            .map_err(|err| SandboxFailure::environment(format!("create workspace: {err}")))?;
        write_plan(&workspace.path().join("plan.json"), plan)
            .map_err(|err| SandboxFailure::environment(format!("{err:#}")))?;
        let script =
            render_script(plan).map_err(|err| SandboxFailure::environment(format!("{err:#}")))?;
        fs::write(workspace.path().join("sandbox.sh"), script)
            .map_err(|err| SandboxFailure::environment(format!("write sandbox script: {err}")))?;

        let spec = ContainerSpec {
            name: container_name(workspace.path()),
            image: reqs.image,
            network: reqs.network,
            limits: ResourceLimits {
                timeout,
                ..reqs.limits
            },
            mounts: vec![
                Mount {
                    source: workspace.path().to_path_buf(),
                    target: WORKSPACE_DIR.to_string(),
                    read_only: false,
                },
                Mount {
                    source: runner.to_path_buf(),
                    target: STEP_RUNNER_PATH.to_string(),
                    read_only: true,
                },
            ],
            env: vec![("PLANNER_PLAN".to_string(), PLAN_PATH.to_string())],
            workdir: WORKSPACE_DIR.to_string(),
            command: vec!["/bin/sh".to_string(), SCRIPT_PATH.to_string()],
        };
        info!(
            container = %spec.name,
            image = %spec.image,
            network = %spec.network,
            timeout_secs = effective.as_secs(),
            "starting sandbox container"
        );

        let output = runtime
            .run(&spec, &control)
            .map_err(|err| SandboxFailure::environment(format!("{err:#}")))?;
        interpret(output, effective)
    }
}

fn skipped(mut states: Vec<SandboxState>, reason: impl Into<String>) -> SandboxRun {
    let reason = reason.into();
    info!(reason = %reason, "sandbox validation skipped");
    states.push(SandboxState::Skipped);
    SandboxRun {
        outcome: SandboxOutcome::Skipped { reason },
        states,
    }
}

fn container_name(workspace: &Path) -> String {
    let suffix = workspace
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("sandbox");
    format!("planner-{}", suffix.trim_start_matches("planner-"))
}

/// Map a finished container run to success or a failure attributed to the
/// last step marker seen.
fn interpret(output: RunOutput, timeout: Duration) -> Result<(), SandboxFailure> {
    let trace = output.markers.clone();
    if output.cancelled {
        return Err(SandboxFailure::Cancelled {
            step_id: trace.last_step,
        });
    }
    if output.timed_out {
        return Err(SandboxFailure::TimedOut {
            step_id: trace.last_step,
            timeout_secs: timeout.as_secs(),
        });
    }
    match output.exit_code {
        Some(0) if trace.completed => Ok(()),
        Some(0) => Err(SandboxFailure::environment(format!(
            "sandbox script exited after {} step(s) without completing",
            trace.steps_started
        ))),
        exit_code => Err(SandboxFailure::StepFailed {
            step_id: trace.last_step.unwrap_or_else(|| SETUP_STEP.to_string()),
            exit_code,
            output: combined_output(&output),
        }),
    }
}

fn combined_output(output: &RunOutput) -> String {
    let mut combined = output.stdout.clone();
    if !output.stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&output.stderr);
    }
    combined
}
