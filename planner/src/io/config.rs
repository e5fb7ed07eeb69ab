//! Planner configuration stored under `.planner/config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = ".planner/config.toml";

/// Planner configuration (TOML).
///
/// Missing fields take the defaults below, so an absent file behaves like an
/// empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Install missing eval-time dependencies without asking.
    pub auto_accept_eval_deps: bool,

    /// Directory holding `<name>.toml` dependency recipes.
    pub recipes_dir: PathBuf,

    /// Host tool installations, one `<name>-<version>` directory each.
    pub tools_dir: PathBuf,

    pub installer: InstallerConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerConfig {
    /// Host install command; the tool name is appended (e.g. `["tsuku","install"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Container runtimes to probe, in preference order.
    pub runtimes: Vec<String>,
    pub probe_timeout_secs: u64,
    /// Binary mounted into the container to execute individual plan steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_runner: Option<PathBuf>,
    pub output_limit_bytes: usize,
    /// Overrides the timeout derived from the plan's resource profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            command: vec!["tsuku".to_string(), "install".to_string()],
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtimes: vec!["podman".to_string(), "docker".to_string()],
            probe_timeout_secs: 10,
            step_runner: None,
            output_limit_bytes: 1_000_000,
            timeout_secs: None,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            auto_accept_eval_deps: false,
            recipes_dir: PathBuf::from("recipes"),
            tools_dir: PathBuf::from(".planner/tools"),
            installer: InstallerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl InstallerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Manual install command suggested in error messages.
    pub fn hint(&self) -> String {
        self.command.join(" ")
    }
}

impl SandboxConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recipes_dir.as_os_str().is_empty() {
            return Err(anyhow!("recipes_dir must not be empty"));
        }
        if self.tools_dir.as_os_str().is_empty() {
            return Err(anyhow!("tools_dir must not be empty"));
        }
        if self.installer.command.is_empty() || self.installer.command[0].trim().is_empty() {
            return Err(anyhow!("installer.command must be a non-empty array"));
        }
        if self.installer.timeout_secs == 0 {
            return Err(anyhow!("installer.timeout_secs must be > 0"));
        }
        if self.installer.output_limit_bytes == 0 {
            return Err(anyhow!("installer.output_limit_bytes must be > 0"));
        }
        if self.sandbox.runtimes.is_empty()
            || self.sandbox.runtimes.iter().any(|r| r.trim().is_empty())
        {
            return Err(anyhow!("sandbox.runtimes must be a non-empty array of names"));
        }
        if self.sandbox.probe_timeout_secs == 0 {
            return Err(anyhow!("sandbox.probe_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.timeout_secs == Some(0) {
            return Err(anyhow!("sandbox.timeout_secs must be > 0 when set"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PlannerConfig::default()`.
pub fn load_config(path: &Path) -> Result<PlannerConfig> {
    if !path.exists() {
        let cfg = PlannerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PlannerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PlannerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a uniquely named sibling temp file, then rename over
/// `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PlannerConfig::default());
        assert_eq!(cfg.installer.hint(), "tsuku install");
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let mut cfg = PlannerConfig::default();
        cfg.auto_accept_eval_deps = true;
        cfg.sandbox.step_runner = Some(PathBuf::from("/opt/step-runner"));
        cfg.sandbox.timeout_secs = Some(90);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        let entries = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[sandbox]\nruntimes = [\"docker\"]\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.sandbox.runtimes, vec!["docker".to_string()]);
        assert_eq!(cfg.sandbox.probe_timeout_secs, 10);
        assert_eq!(cfg.installer, InstallerConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[installer]\ncommand = []\n").expect("write");
        let err = load_config(&path).expect_err("empty command");
        assert!(format!("{err:#}").contains("installer.command"));

        let mut cfg = PlannerConfig::default();
        cfg.sandbox.timeout_secs = Some(0);
        assert!(cfg.validate().is_err());
        assert!(write_config(&path, &cfg).is_err());
    }

    #[test]
    fn concurrent_writes_leave_one_complete_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let contents = format!("{{\"writer\": {n}}}\n").repeat(256);
                    for _ in 0..20 {
                        write_atomic(&path, &contents).expect("write");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("join");
        }

        let written = fs::read_to_string(&path).expect("read");
        let first = written.lines().next().expect("line");
        assert!(written.lines().all(|line| line == first));
        assert_eq!(written.lines().count(), 256);
        assert_eq!(fs::read_dir(temp.path()).expect("read dir").count(), 1);
    }
}
