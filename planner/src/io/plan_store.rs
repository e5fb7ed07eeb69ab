//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;

use crate::core::invariants::validate_invariants;
use crate::io::config::write_atomic;
use crate::plan::{PLAN_FORMAT_VERSION, Plan};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan/v2.schema.json");

static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(PLAN_SCHEMA).map_err(|err| format!("parse plan schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("invalid plan schema: {err}"))
});

/// Load and validate a plan from disk (format version, schema, invariants).
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", path.display()))?;
    check_format_version(&value)?;
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", path.display()))?;
    let errors = validate_invariants(&plan);
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
    }
    Ok(plan)
}

/// Write a plan as pretty JSON, atomically.
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn check_format_version(value: &Value) -> Result<()> {
    match value.get("format_version").and_then(Value::as_u64) {
        Some(version) if version == u64::from(PLAN_FORMAT_VERSION) => Ok(()),
        Some(version) => Err(anyhow!(
            "unsupported plan format_version {version} (expected {PLAN_FORMAT_VERSION})"
        )),
        None => Err(anyhow!("plan is missing format_version")),
    }
}

fn validate_schema(plan: &Value) -> Result<()> {
    let compiled = VALIDATOR.as_ref().map_err(|err| anyhow!("{err}"))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
