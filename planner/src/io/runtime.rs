//! Container runtime detection and invocation.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::markers::{Marker, MarkerTrace, parse_marker};
use crate::io::process::{
    LineSink, RunControl, run_command_controlled, run_command_with_timeout,
};

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    None,
    Host,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::None => f.write_str("none"),
            NetworkMode::Host => f.write_str("host"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Runtime memory syntax, e.g. `2g`.
    pub memory: String,
    pub cpus: u32,
    pub pids: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to start one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: NetworkMode,
    pub limits: ResourceLimits,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub workdir: String,
    pub command: Vec<String>,
}

/// Result of one container run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: Option<i32>,
    /// Captured stdout, possibly truncated.
    pub stdout: String,
    pub stderr: String,
    /// Markers seen on the full stdout stream, including truncated parts.
    pub markers: MarkerTrace,
    pub timed_out: bool,
    pub cancelled: bool,
}

pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Run the container to completion, or until `control` stops it. A
    /// stopped container must be removed before returning.
    fn run(&self, spec: &ContainerSpec, control: &RunControl) -> Result<RunOutput>;
}

pub trait RuntimeDetector: Send + Sync {
    /// First usable runtime, or `None` when isolation is unavailable.
    fn detect(&self) -> Option<Arc<dyn ContainerRuntime>>;
}

/// Container runtime driven through its CLI (`podman`/`docker`).
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
    output_limit_bytes: usize,
}

impl CliRuntime {
    pub fn new(program: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            program: program.into(),
            output_limit_bytes,
        }
    }

    /// Arguments for `<program> run ...`.
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            format!("--network={}", spec.network),
            format!("--memory={}", spec.limits.memory),
            format!("--cpus={}", spec.limits.cpus),
            format!("--pids-limit={}", spec.limits.pids),
            "--workdir".to_string(),
            spec.workdir.clone(),
        ];
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    fn remove(&self, name: &str) {
        let mut cmd = Command::new(&self.program);
        cmd.args(["rm", "-f", name]);
        match run_command_with_timeout(cmd, TEARDOWN_TIMEOUT, 4096) {
            Ok(output) if output.status.success() => debug!(container = name, "container removed"),
            Ok(output) => warn!(
                container = name,
                exit_code = ?output.status.code(),
                stderr = %output.stderr_lossy().trim(),
                "container removal failed"
            ),
            Err(err) => warn!(container = name, err = %format!("{err:#}"), "container removal failed"),
        }
    }
}

/// Logs progress and records markers into `trace` as lines stream in.
fn progress_sink(trace: Arc<Mutex<MarkerTrace>>) -> LineSink {
    Box::new(move |line: &str| {
        match parse_marker(line) {
            Some(Marker::Step { id, action }) => info!(step = id, action, "sandbox step started"),
            Some(Marker::Complete) => info!("sandbox steps complete"),
            None => debug!(line, "sandbox output"),
        }
        trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(line);
    })
}

impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(skip_all, fields(runtime = %self.program, container = %spec.name, image = %spec.image))]
    fn run(&self, spec: &ContainerSpec, control: &RunControl) -> Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::run_args(spec));
        let trace = Arc::new(Mutex::new(MarkerTrace::default()));
        let output = run_command_controlled(
            cmd,
            control,
            self.output_limit_bytes,
            Some(progress_sink(Arc::clone(&trace))),
        )
        .with_context(|| format!("run {} container {}", self.program, spec.name))?;
        let markers = trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if output.timed_out || output.cancelled {
            self.remove(&spec.name);
        }

        let mut stdout = output.stdout_lossy();
        stdout.push_str(&output.stdout_truncated_notice("sandbox"));
        let mut stderr = output.stderr_lossy();
        stderr.push_str(&output.stderr_truncated_notice("sandbox"));
        Ok(RunOutput {
            exit_code: output.status.code(),
            stdout,
            stderr,
            markers,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
        })
    }
}

/// Probes candidate runtimes with `<runtime> --version`; the first success wins.
#[derive(Debug, Clone)]
pub struct ProbeDetector {
    candidates: Vec<String>,
    probe_timeout: Duration,
    output_limit_bytes: usize,
}

impl ProbeDetector {
    pub fn new(candidates: Vec<String>, probe_timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            candidates,
            probe_timeout,
            output_limit_bytes,
        }
    }

    fn probe(&self, program: &str) -> bool {
        let mut cmd = Command::new(program);
        cmd.arg("--version");
        match run_command_with_timeout(cmd, self.probe_timeout, 4096) {
            Ok(output) if output.status.success() && !output.timed_out => true,
            Ok(output) => {
                debug!(runtime = program, exit_code = ?output.status.code(), "runtime probe failed");
                false
            }
            Err(err) => {
                debug!(runtime = program, err = %format!("{err:#}"), "runtime unavailable");
                false
            }
        }
    }
}

impl RuntimeDetector for ProbeDetector {
    #[instrument(skip_all, fields(candidates = ?self.candidates))]
    fn detect(&self) -> Option<Arc<dyn ContainerRuntime>> {
        let program = self.candidates.iter().find(|c| self.probe(c))?;
        info!(runtime = %program, "container runtime detected");
        Some(Arc::new(CliRuntime::new(
            program.clone(),
            self.output_limit_bytes,
        )))
    }
}
