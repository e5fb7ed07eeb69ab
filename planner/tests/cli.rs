//! CLI tests for `planner plan`, `planner validate` and `planner build`.
//!
//! Spawns the planner binary against fixture recipes and checks exit codes
//! and output streams.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use planner::exit_codes;
use planner::generate::{PlanOptions, generate_plan};
use planner::io::config::{PlannerConfig, write_config};
use planner::io::plan_store::write_plan;
use planner::plan::{Plan, Platform};
use planner::recipe::Step;
use planner::test_support::{InMemoryHost, recipe};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/recipes")
}

/// Config pointing at the fixture recipes, an empty tools dir and no usable
/// container runtime.
fn write_test_config(dir: &Path) -> PathBuf {
    let mut cfg = PlannerConfig {
        recipes_dir: fixtures(),
        tools_dir: dir.join("tools"),
        ..PlannerConfig::default()
    };
    cfg.installer.command = vec!["false".to_string()];
    cfg.sandbox.runtimes = vec!["planner-no-such-runtime".to_string()];
    cfg.sandbox.probe_timeout_secs = 2;
    let path = dir.join("config.toml");
    write_config(&path, &cfg).expect("write config");
    path
}

fn planner(dir: &Path, args: &[&str]) -> Output {
    let config = write_test_config(dir);
    Command::new(env!("CARGO_BIN_EXE_planner"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(&config)
        .args(args)
        .output()
        .expect("run planner")
}

#[test]
fn plan_prints_plan_json() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = planner(temp.path(), &["plan", "jq", "--os", "linux", "--arch", "amd64"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let plan: Plan = serde_json::from_slice(&output.stdout).expect("plan json");
    assert_eq!(plan.tool, "jq");
    assert_eq!(plan.version, "1.7.1");
    assert_eq!(plan.platform, Platform::new("linux", "amd64"));
    assert_eq!(plan.steps.len(), 3);
    assert!(plan.verify.is_some());
}

#[test]
fn plan_writes_output_file_then_validate_skips_without_runtime() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan_path = temp.path().join("jq.plan.json");

    let output = planner(
        temp.path(),
        &["plan", "jq", "--output", plan_path.to_str().expect("utf8 path")],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(output.stdout.is_empty());
    assert!(plan_path.is_file());

    let output = planner(temp.path(), &["validate", plan_path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("skipped: no container runtime available"), "{stderr}");
}

#[test]
fn validate_refuses_incomplete_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let host = InMemoryHost::new().with_tool("python-standalone", "3.12.1");
    let ruff = recipe("ruff", vec![Step::new("pipx_install").param("package", "ruff")]);
    let plan = generate_plan(&ruff, &Platform::new("linux", "amd64"), &PlanOptions::new(&host))
        .expect("plan");
    let plan_path = temp.path().join("ruff.plan.json");
    write_plan(&plan_path, &plan).expect("write plan");

    let output = planner(temp.path(), &["validate", plan_path.to_str().expect("utf8 path")]);

    assert_eq!(output.status.code(), Some(exit_codes::SANDBOX_FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("plan incomplete"), "{stderr}");
    assert!(stderr.contains("python-standalone"), "{stderr}");
}

#[test]
fn declined_eval_dependency_exits_with_declined_code() {
    let temp = tempfile::tempdir().expect("tempdir");

    // stdin is closed, so the consent prompt reads an empty answer.
    let output = planner(temp.path(), &["plan", "ruff"]);

    assert_eq!(output.status.code(), Some(exit_codes::DECLINED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Install now? [y/N]"), "{stderr}");
    assert!(stderr.contains("python-standalone"), "{stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn unknown_dependency_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = planner(temp.path(), &["plan", "bottle", "--os", "linux"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unknown dependency 'patchelf' (required by 'bottle')"),
        "{stderr}"
    );
}

#[test]
fn plan_accepts_recipe_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = fixtures().join("python-standalone.toml");

    let output = planner(
        temp.path(),
        &["plan", path.to_str().expect("utf8 path"), "--os", "linux", "--arch", "amd64"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let plan: Plan = serde_json::from_slice(&output.stdout).expect("plan json");
    assert_eq!(plan.tool, "python-standalone");
    assert_eq!(plan.steps[1].params["strip_dirs"], 1);
}

#[test]
fn build_from_registry_reports_skipped_sandbox() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = planner(
        temp.path(),
        &["build", "registry", "jq", "--os", "linux", "--arch", "amd64"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let plan: Plan = serde_json::from_slice(&output.stdout).expect("plan json");
    assert_eq!(plan.tool, "jq");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sandbox: skipped"), "{stderr}");
}
