//! Pipe binding: the target is a child process speaking JSON lines.
//!
//! Each command is written as one newline-terminated JSON object on the
//! child's stdin; the next non-blank stdout line is its response. The
//! child's stderr is drained in the background so it can never fill up
//! and stall the target, and the tail is kept for error reports.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Transport;
use crate::config::{AgentConfig, TransportKind};
use crate::error::DriveError;
use crate::protocol::{Command, Response};

/// Number of stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 64;

/// How long to let the stderr drain catch up after the target hangs up.
const STDERR_DRAIN_WAIT: Duration = Duration::from_millis(250);

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A running target and its pipes.
struct TargetProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    /// Set once a request went unanswered; a late reply would otherwise be
    /// read as the answer to the next command.
    desynced: bool,
}

impl TargetProcess {
    fn stderr_snapshot(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Let the stderr reader finish once the target has gone away.
    async fn drain_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_WAIT, task).await;
        }
    }
}

/// Drives a target executable over its standard streams.
pub struct PipeTransport {
    executable: Option<PathBuf>,
    args: Vec<String>,
    timeout: Duration,
    settle_delay: Duration,
    shutdown_grace: Duration,
    process: Option<TargetProcess>,
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("running", &self.process.is_some())
            .finish()
    }
}

impl PipeTransport {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            timeout: config.action_timeout,
            settle_delay: config.settle_delay,
            shutdown_grace: config.shutdown_grace,
            process: None,
        }
    }

    /// OS pid of the running target, if any.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    fn unresponsive(&self, command: &Command, reason: impl Into<String>, stderr: String) -> DriveError {
        DriveError::TargetUnresponsive {
            action: command.action().to_string(),
            timeout: self.timeout,
            reason: reason.into(),
            stderr,
        }
    }
}

/// Outcome of one write-then-read exchange, before timeout handling.
enum Exchange {
    Line(String),
    Closed,
    WriteFailed(std::io::Error),
    ReadFailed(std::io::Error),
}

async fn exchange(process: &mut TargetProcess, line: &str) -> Exchange {
    let Some(stdin) = process.stdin.as_mut() else {
        return Exchange::WriteFailed(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "stdin already closed",
        ));
    };
    let written = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    };
    if let Err(e) = written.await {
        return Exchange::WriteFailed(e);
    }

    loop {
        match process.stdout.next_line().await {
            Ok(Some(reply)) if reply.trim().is_empty() => continue,
            Ok(Some(reply)) => return Exchange::Line(reply),
            Ok(None) => return Exchange::Closed,
            Err(e) => return Exchange::ReadFailed(e),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn start(&mut self) -> Result<(), DriveError> {
        if self.process.is_some() {
            warn!("start requested while a target is still running; stopping it first");
            self.stop().await?;
        }

        let executable = self.executable.as_ref().ok_or_else(|| {
            DriveError::Configuration("an executable path is required for the pipe transport".to_string())
        })?;

        info!(executable = %executable.display(), args = ?self.args, "starting target");

        let mut child = ProcessCommand::new(executable)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriveError::Configuration(format!(
                    "failed to spawn target {}: {e}",
                    executable.display()
                ))
            })?;

        let missing = |stream: &str| DriveError::Configuration(format!("target {stream} was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let sink = Arc::clone(&stderr_tail);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "drover::target", "{line}");
                let mut tail = sink.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        debug!(pid = ?child.id(), "target spawned");

        self.process = Some(TargetProcess {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
            stderr_task: Some(stderr_task),
            desynced: false,
        });

        // No handshake: give the target a moment to come up.
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DriveError> {
        let Some(mut process) = self.process.take() else {
            debug!("stop requested with no running target");
            return Ok(());
        };

        info!(pid = ?process.child.id(), "stopping target");

        // Closing stdin is the polite hang-up for a line-driven target.
        drop(process.stdin.take());

        #[cfg(unix)]
        {
            if let Some(pid) = process.child.id() {
                // SAFETY: pid belongs to a child we spawned and have not reaped.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    debug!(pid, "SIGTERM not delivered (target may have exited)");
                }
            }
        }

        match tokio::time::timeout(self.shutdown_grace, process.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "target exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait on target"),
            Err(_) => {
                warn!(grace = ?self.shutdown_grace, "target ignored SIGTERM, killing");
                if let Err(e) = process.child.kill().await {
                    warn!(error = %e, "failed to kill target");
                }
            }
        }

        if let Some(task) = process.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn send(&mut self, command: &Command) -> Result<Response, DriveError> {
        let line = command.to_line()?;
        let timeout = self.timeout;
        let Some(process) = self.process.as_mut() else {
            return Err(DriveError::NotRunning);
        };

        if process.desynced {
            let stderr = process.stderr_snapshot();
            return Err(self.unresponsive(
                command,
                "channel out of sync after an earlier unanswered command",
                stderr,
            ));
        }

        debug!(command = %line, "sending command");

        let outcome = tokio::time::timeout(timeout, exchange(process, &line)).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                process.desynced = true;
                let stderr = process.stderr_snapshot();
                return Err(self.unresponsive(command, format!("no response within {timeout:?}"), stderr));
            }
        };

        match outcome {
            Exchange::Line(raw) => {
                let response = Response::parse(&raw)?;
                debug!(response = %raw.trim(), "received response");
                Ok(response)
            }
            Exchange::Closed => {
                process.desynced = true;
                process.drain_stderr().await;
                let stderr = process.stderr_snapshot();
                Err(self.unresponsive(command, "target closed its output unexpectedly", stderr))
            }
            Exchange::WriteFailed(e) => {
                // A broken pipe means the target is gone; collect its last words.
                process.desynced = true;
                process.drain_stderr().await;
                let stderr = process.stderr_snapshot();
                Err(self.unresponsive(command, format!("failed to write command: {e}"), stderr))
            }
            Exchange::ReadFailed(e) => {
                process.desynced = true;
                let stderr = process.stderr_snapshot();
                Err(self.unresponsive(command, format!("failed to read response: {e}"), stderr))
            }
        }
    }

    fn is_active(&self) -> bool {
        self.process.is_some()
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            if let Some(task) = process.stderr_task.take() {
                task.abort();
            }
            // kill_on_drop reaps the child itself.
            warn!(pid = ?process.child.id(), "pipe transport dropped with a running target");
        }
    }
}
