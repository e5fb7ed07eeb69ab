use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use planner::generate::{PlanOptions, generate_plan};
use planner::io::process::RunControl;
use planner::io::runtime::{NetworkMode, RunOutput};
use planner::plan::{Plan, Platform};
use planner::recipe::Step;
use planner::sandbox::{
    BUILD_IMAGE, DEFAULT_IMAGE, STEP_RUNNER_PATH, SandboxExecutor, SandboxFailure,
    SandboxOutcome, SandboxSettings, SandboxState,
};
use planner::test_support::{
    InMemoryHost, MapRecipeLoader, RecordingInstaller, ScriptedDetector, ScriptedRuntime,
    fake_step_runner, recipe, run_output,
};

fn settings(dir: &Path) -> SandboxSettings {
    SandboxSettings {
        step_runner: Some(fake_step_runner(dir)),
        output_limit_bytes: 64 * 1024,
        timeout_override: None,
    }
}

fn jq_plan() -> Plan {
    let host = InMemoryHost::new();
    let jq = recipe(
        "jq",
        vec![
            Step::new("download_file")
                .param("url", "https://example.com/jq-linux-amd64")
                .param("dest", "jq"),
            Step::new("install_binaries").param("binaries", vec!["jq"]),
        ],
    );
    generate_plan(&jq, &Platform::new("linux", "amd64"), &PlanOptions::new(&host)).expect("plan")
}

fn ruff_plan() -> Plan {
    let host = InMemoryHost::new();
    let installer = RecordingInstaller::new().installing_into(&host);
    let loader = MapRecipeLoader::new().with(recipe(
        "python-standalone",
        vec![
            Step::new("download_archive")
                .param("url", "https://example.com/cpython-3.12.1.tar.gz")
                .param("binaries", vec!["bin/python3"]),
        ],
    ));
    let options = PlanOptions::new(&host)
        .with_installer(&installer)
        .with_loader(&loader)
        .auto_accept(true);
    let ruff = recipe("ruff", vec![Step::new("pipx_install").param("package", "ruff")]);
    let plan = generate_plan(&ruff, &Platform::new("linux", "amd64"), &options).expect("plan");
    assert_eq!(installer.requested(), vec!["python-standalone".to_string()]);
    plan
}

fn executor(runtime: &Arc<ScriptedRuntime>, dir: &Path) -> SandboxExecutor<ScriptedDetector> {
    SandboxExecutor::new(ScriptedDetector::with_runtime(Arc::clone(runtime)), settings(dir))
}

/// Verifies an incomplete plan is refused before any runtime is touched.
#[test]
fn incomplete_plan_fails_without_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::new());
    let host = InMemoryHost::new().with_tool("python-standalone", "3.12.1");
    let ruff = recipe("ruff", vec![Step::new("pipx_install").param("package", "ruff")]);
    let plan = generate_plan(&ruff, &Platform::new("linux", "amd64"), &PlanOptions::new(&host))
        .expect("plan");

    let run = executor(&runtime, temp.path()).run(&plan, &RunControl::unbounded());

    assert_eq!(
        run.outcome,
        SandboxOutcome::Failed(SandboxFailure::PlanIncomplete {
            missing: vec!["python-standalone".to_string()]
        })
    );
    assert_eq!(run.states, vec![SandboxState::NotStarted, SandboxState::Failed]);
    assert!(runtime.runs().is_empty());
}

/// Verifies a host without a container runtime skips validation.
#[test]
fn missing_runtime_skips() {
    let temp = tempfile::tempdir().expect("tempdir");
    let executor = SandboxExecutor::new(ScriptedDetector::none(), settings(temp.path()));

    let run = executor.run(&jq_plan(), &RunControl::unbounded());

    assert_eq!(
        run.outcome,
        SandboxOutcome::Skipped {
            reason: "no container runtime available".to_string()
        }
    );
    assert!(run.outcome.is_ok());
    assert_eq!(
        run.states,
        vec![
            SandboxState::NotStarted,
            SandboxState::RuntimeDetection,
            SandboxState::Skipped
        ]
    );
}

/// Verifies an unconfigured or absent step runner skips validation.
#[test]
fn missing_step_runner_skips() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::new());
    let unconfigured = SandboxExecutor::new(
        ScriptedDetector::with_runtime(Arc::clone(&runtime)),
        SandboxSettings {
            step_runner: None,
            output_limit_bytes: 1024,
            timeout_override: None,
        },
    );
    let absent = SandboxExecutor::new(
        ScriptedDetector::with_runtime(Arc::clone(&runtime)),
        SandboxSettings {
            step_runner: Some(temp.path().join("no-such-runner")),
            output_limit_bytes: 1024,
            timeout_override: None,
        },
    );

    let plan = jq_plan();
    for executor in [&unconfigured, &absent] {
        let outcome = executor.validate(&plan, &RunControl::unbounded());
        let SandboxOutcome::Skipped { reason } = &outcome else {
            panic!("expected skip, got {outcome:?}");
        };
        assert!(reason.contains("step runner"), "{reason}");
    }
    assert!(runtime.runs().is_empty());
}

/// Verifies the failing step is taken from the last marker before exit.
#[test]
fn failing_step_is_reported_from_markers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut output = run_output(
        Some(1),
        "@@step jq#0 download_file\nfetched\n@@step jq#1 install_binaries\n",
    );
    output.stderr = "install: jq: permission denied\n".to_string();
    let runtime = Arc::new(ScriptedRuntime::new().with_output(output));

    let run = executor(&runtime, temp.path()).run(&jq_plan(), &RunControl::unbounded());

    let failure = run.outcome.failure().expect("failure");
    assert_eq!(failure.step_id(), Some("jq#1"));
    let SandboxFailure::StepFailed { exit_code, output, .. } = failure else {
        panic!("expected step failure, got {failure:?}");
    };
    assert_eq!(*exit_code, Some(1));
    assert!(output.contains("permission denied"));
    assert_eq!(run.states.last(), Some(&SandboxState::Failed));
    assert!(run.states.contains(&SandboxState::Running));
}

/// Verifies cancellation and timeouts surface as different failures.
#[test]
fn cancel_and_timeout_are_distinct() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cancelled = RunOutput {
        cancelled: true,
        ..run_output(None, "@@step jq#0 download_file\n")
    };
    let timed_out = RunOutput {
        timed_out: true,
        ..run_output(None, "@@step jq#1 install_binaries\n")
    };
    let runtime = Arc::new(
        ScriptedRuntime::new()
            .with_output(cancelled)
            .with_output(timed_out),
    );
    let executor = executor(&runtime, temp.path());
    let plan = jq_plan();

    let first = executor.validate(&plan, &RunControl::unbounded());
    let second = executor.validate(&plan, &RunControl::unbounded());

    assert_eq!(
        first,
        SandboxOutcome::Failed(SandboxFailure::Cancelled {
            step_id: Some("jq#0".to_string())
        })
    );
    let Some(SandboxFailure::TimedOut { step_id, .. }) = second.failure() else {
        panic!("expected timeout, got {second:?}");
    };
    assert_eq!(step_id.as_deref(), Some("jq#1"));
}

/// Verifies a token cancelled before the run never starts a container.
#[test]
fn cancelled_token_stops_before_container_start() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::new());
    let control = RunControl::unbounded();
    control.cancel.cancel();

    let outcome = executor(&runtime, temp.path()).validate(&jq_plan(), &control);

    assert_eq!(
        outcome,
        SandboxOutcome::Failed(SandboxFailure::Cancelled { step_id: None })
    );
    assert!(runtime.runs().is_empty());
}

/// Verifies the configured timeout override bounds the container run.
#[test]
fn timeout_override_bounds_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::new());
    let mut settings = settings(temp.path());
    settings.timeout_override = Some(Duration::from_secs(5));
    let executor = SandboxExecutor::new(ScriptedDetector::with_runtime(Arc::clone(&runtime)), settings);

    let outcome = executor.validate(&jq_plan(), &RunControl::unbounded());

    assert_eq!(outcome, SandboxOutcome::Succeeded);
    let runs = runtime.runs();
    assert_eq!(runs[0].spec.limits.timeout, Duration::from_secs(5));
    let budget = runs[0].budget.expect("deadline set");
    assert!(budget <= Duration::from_secs(5));
}

/// Verifies an offline binary plan runs with no network on the default image.
#[test]
fn offline_plan_runs_isolated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::new());

    let outcome = executor(&runtime, temp.path()).validate(&jq_plan(), &RunControl::unbounded());

    assert_eq!(outcome, SandboxOutcome::Succeeded);
    let spec = &runtime.runs()[0].spec;
    assert_eq!(spec.network, NetworkMode::None);
    assert_eq!(spec.image, DEFAULT_IMAGE);
    assert!(spec.name.starts_with("planner-"));
}

/// Verifies runtime start-up errors are environment failures.
#[test]
fn runtime_error_is_environment_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(ScriptedRuntime::failing_to_start());

    let outcome = executor(&runtime, temp.path()).validate(&jq_plan(), &RunControl::unbounded());

    let Some(SandboxFailure::Environment { message }) = outcome.failure() else {
        panic!("expected environment failure, got {outcome:?}");
    };
    assert!(message.contains("runtime client not found"));
}

/// Verifies the ruff scenario: python installs first, pip_exec runs, success.
#[test]
fn ruff_plan_installs_python_first_and_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let stdout = "\
@@step python-standalone#0 download_file
@@step python-standalone#1 extract
@@step python-standalone#2 chmod
@@step python-standalone#3 install_binaries
@@step ruff#0 pip_exec
Successfully installed ruff-0.4.4
@@complete
";
    let runtime = Arc::new(ScriptedRuntime::new().with_output(run_output(Some(0), stdout)));
    let plan = ruff_plan();

    let run = executor(&runtime, temp.path()).run(&plan, &RunControl::unbounded());

    assert_eq!(run.outcome, SandboxOutcome::Succeeded);
    assert_eq!(
        run.states,
        vec![
            SandboxState::NotStarted,
            SandboxState::RuntimeDetection,
            SandboxState::Running,
            SandboxState::Succeeded
        ]
    );

    let recorded = &runtime.runs()[0];
    assert_eq!(recorded.spec.network, NetworkMode::Host);
    assert_eq!(recorded.spec.image, BUILD_IMAGE);
    assert!(
        recorded
            .spec
            .mounts
            .iter()
            .any(|mount| mount.target == STEP_RUNNER_PATH && mount.read_only)
    );

    let python = recorded
        .script
        .find("'python-standalone#0'")
        .expect("python step in script");
    let pip = recorded.script.find("'ruff#0'").expect("ruff step in script");
    assert!(python < pip);

    let mounted: Plan = serde_json::from_str(&recorded.plan_json).expect("plan json");
    assert_eq!(mounted, plan);
}
