//! Helpers for running child processes with deadlines, cancellation and
//! bounded output.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget;

/// Granularity at which a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output pipes may stay open once the call has been stopped.
/// Descendants of a killed child can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

type Captured = Result<(Vec<u8>, usize)>;

/// Shared flag asking a long-running operation to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation handle for one long-running call.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
}

impl RunControl {
    /// No deadline, fresh token.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancelToken::new(),
        }
    }

    /// Same token, deadline no later than `now + timeout`.
    pub fn tightened(&self, timeout: Duration) -> Self {
        Self {
            deadline: Some(budget::tighten(self.deadline, timeout)),
            cancel: self.cancel.clone(),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(budget::remaining)
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Callback receiving each stdout line as it arrives.
pub type LineSink = Box<dyn Fn(&str) + Send>;

/// Run a command with a fixed timeout and capture stdout/stderr without
/// risking pipe deadlocks.
pub fn run_command_with_timeout(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_controlled(
        cmd,
        &RunControl::with_timeout(timeout),
        output_limit_bytes,
        None,
    )
}

/// Run a command until it exits, the deadline passes, or the token is
/// cancelled.
///
/// Output is read concurrently while the child runs. `output_limit_bytes`
/// bounds the amount of stdout/stderr kept in memory (bytes beyond it are
/// drained and counted). If `on_stdout_line` is set, every stdout line is
/// passed to it as it arrives.
///
/// Once the call is stopped, readers get [`DRAIN_GRACE`] to reach EOF. A
/// stream still held open after that is abandoned with whatever the caller
/// already saw through `on_stdout_line`.
#[instrument(skip_all, fields(output_limit_bytes, streaming = on_stdout_line.is_some()))]
pub fn run_command_controlled(
    mut cmd: Command,
    control: &RunControl,
    output_limit_bytes: usize,
    on_stdout_line: Option<LineSink>,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            debug!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = stdout_tx.send(read_lines_limited(stdout, output_limit_bytes, on_stdout_line));
    });
    thread::spawn(move || {
        let _ = stderr_tx.send(read_stream_limited(stderr, output_limit_bytes));
    });

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if control.cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
            break kill_and_reap(&mut child)?;
        }
        let slice = match control.remaining() {
            Some(remaining) if remaining.is_zero() => {
                warn!("command deadline passed, killing");
                timed_out = true;
                break kill_and_reap(&mut child)?;
            }
            Some(remaining) => remaining.min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
    };

    let mut stopped_at = (timed_out || cancelled).then(Instant::now);
    let (stdout, stdout_truncated) =
        await_output(&stdout_rx, control, &mut stopped_at).context("join stdout")?;
    let (stderr, stderr_truncated) =
        await_output(&stderr_rx, control, &mut stopped_at).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

/// Wait for a reader to finish. After the call is stopped (here or by the
/// caller's deadline or token) the wait is bounded by [`DRAIN_GRACE`].
fn await_output(
    rx: &Receiver<Captured>,
    control: &RunControl,
    stopped_at: &mut Option<Instant>,
) -> Captured {
    loop {
        if stopped_at.is_none()
            && (control.cancel.is_cancelled() || control.remaining().is_some_and(|r| r.is_zero()))
        {
            *stopped_at = Some(Instant::now());
        }
        let wait = match stopped_at {
            Some(since) => {
                let left = DRAIN_GRACE.saturating_sub(since.elapsed());
                if left.is_zero() {
                    warn!("output pipe still open after stop, abandoning reader");
                    return Ok((Vec::new(), 0));
                }
                left.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(captured) => return captured,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
}

/// Read a stream line by line with a size limit, forwarding lines to `sink`.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    sink: Option<LineSink>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(sink) = &sink {
            sink(String::from_utf8_lossy(&line).trim_end_matches(['\n', '\r']));
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
