//! Consent-gated installation of eval-time dependencies onto the host.

use std::io::{self, BufRead, Write};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::io::config::InstallerConfig;
use crate::io::host::HostTools;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("user declined to install dependencies: {}", .tools.join(", "))]
    Declined { tools: Vec<String> },
    #[error("could not ask for consent to install {}", .tools.join(", "))]
    Consent {
        tools: Vec<String>,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to install '{tool}'")]
    Failed {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Installs eval-time dependencies onto the controlling host.
pub trait DependencyInstaller: Send + Sync {
    /// Make every tool in `deps` present on the host. Already-present tools
    /// are skipped. Without `auto_accept` the user is asked first and a
    /// refusal aborts the whole call.
    fn ensure(&self, deps: &[String], auto_accept: bool) -> Result<(), InstallError>;
}

/// Interactive confirmation and progress notices.
pub trait Consent: Send + Sync {
    fn confirm(&self, tools: &[String]) -> Result<bool>;
    fn notice(&self, message: &str);
}

/// The host's standard install path for one tool.
pub trait ToolInstall: Send + Sync {
    fn install(&self, tool: &str) -> Result<()>;
}

impl<T: Consent + ?Sized> Consent for &T {
    fn confirm(&self, tools: &[String]) -> Result<bool> {
        (**self).confirm(tools)
    }

    fn notice(&self, message: &str) {
        (**self).notice(message);
    }
}

impl<T: ToolInstall + ?Sized> ToolInstall for &T {
    fn install(&self, tool: &str) -> Result<()> {
        (**self).install(tool)
    }
}

/// Prompts on stderr and reads the answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioConsent;

impl Consent for StdioConsent {
    fn confirm(&self, tools: &[String]) -> Result<bool> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "The following tools are required for evaluation:")?;
        for tool in tools {
            writeln!(stderr, "  - {tool}")?;
        }
        write!(stderr, "\nInstall now? [y/N]: ")?;
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read consent answer")?;
        Ok(parse_consent_answer(&answer))
    }

    fn notice(&self, message: &str) {
        eprintln!("{message}");
    }
}

/// Only `y`/`yes` (any case) accept; everything else declines.
pub fn parse_consent_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Runs the configured install command with the tool name appended.
#[derive(Debug, Clone)]
pub struct CommandToolInstall {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandToolInstall {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &InstallerConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.timeout(), cfg.output_limit_bytes)
    }
}

impl ToolInstall for CommandToolInstall {
    #[instrument(skip_all, fields(tool))]
    fn install(&self, tool: &str) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("installer command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(tool);

        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {program} for {tool}"))?;
        debug!(stdout = %output.stdout_lossy(), "install command output");
        if output.timed_out {
            return Err(anyhow!(
                "install timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "install command exited with {:?}: {}{}",
                output.status.code(),
                output.stderr_lossy().trim(),
                output.stderr_truncated_notice("install")
            ));
        }
        Ok(())
    }
}

/// [`DependencyInstaller`] built from a host query, a consent policy and an
/// install path.
pub struct HostInstaller<H, C, T> {
    host: H,
    consent: C,
    tools: T,
}

impl<H: HostTools, C: Consent, T: ToolInstall> HostInstaller<H, C, T> {
    pub fn new(host: H, consent: C, tools: T) -> Self {
        Self {
            host,
            consent,
            tools,
        }
    }
}

impl<H: HostTools, C: Consent, T: ToolInstall> DependencyInstaller for HostInstaller<H, C, T> {
    #[instrument(skip_all, fields(requested = deps.len(), auto_accept))]
    fn ensure(&self, deps: &[String], auto_accept: bool) -> Result<(), InstallError> {
        let missing: Vec<String> = deps
            .iter()
            .filter(|dep| !self.host.is_installed(dep))
            .cloned()
            .collect();
        if missing.is_empty() {
            debug!("all eval-time dependencies already present");
            return Ok(());
        }

        if auto_accept {
            self.consent.notice(&format!(
                "Installing eval-time dependencies: {}",
                missing.join(", ")
            ));
        } else {
            let accepted = self
                .consent
                .confirm(&missing)
                .map_err(|source| InstallError::Consent {
                    tools: missing.clone(),
                    source,
                })?;
            if !accepted {
                info!(tools = ?missing, "eval-time dependency install declined");
                return Err(InstallError::Declined { tools: missing });
            }
        }

        for tool in &missing {
            self.consent.notice(&format!("Installing {tool}..."));
            self.tools
                .install(tool)
                .map_err(|source| InstallError::Failed {
                    tool: tool.clone(),
                    source,
                })?;
            info!(tool = %tool, "installed eval-time dependency");
        }
        Ok(())
    }
}
