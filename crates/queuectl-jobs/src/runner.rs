//! Command runner: executes a job's command and captures what it printed.
//!
//! A non-zero exit, a spawn error, or a timeout is not an [`Error`]: it is a
//! [`CommandOutput`] with `success = false`, which the worker routes through
//! the retry policy.
//!
//! [`Error`]: queuectl_core::Error

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a command run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, absent when the process was killed or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Why the run failed, if it did.
    pub error: Option<String>,
}

impl CommandOutput {
    /// Successful run with the given stdout.
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Failed run with the given error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Stdout followed by stderr; stored as the job's output on success.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }

    /// Message recorded as the job's last error.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        match (&self.error, stderr.is_empty()) {
            (Some(error), false) => format!("{error}: {stderr}"),
            (Some(error), true) => error.clone(),
            (None, false) => stderr.to_string(),
            (None, true) => "failed".to_string(),
        }
    }
}

/// Executes job commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`. `timeout_ms == 0` means no timeout.
    async fn execute(&self, command: &str, timeout_ms: u64) -> CommandOutput;
}

/// Runs commands through the system shell (`sh -c`, or `cmd /C` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// How long to keep reading pipes after a timed-out command is killed.
/// A background grandchild can hold them open indefinitely.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Reads a child pipe into a shared buffer so whatever arrived is available
/// even if the reader never sees EOF.
struct PipeCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeCapture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, task }
    }

    /// Wait for EOF (at most `grace`, if given) and return what was read.
    async fn finish(self, grace: Option<Duration>) -> String {
        let mut task = self.task;
        match grace {
            Some(grace) => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    task.abort();
                }
            }
            None => {
                let _ = (&mut task).await;
            }
        }
        let bytes = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn execute(&self, command: &str, timeout_ms: u64) -> CommandOutput {
        let start = Instant::now();

        let mut child = match Self::shell_command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "runner",
                    command,
                    error = %e,
                    "Failed to spawn command"
                );
                return CommandOutput::failed(format!("failed to spawn command: {e}"));
            }
        };
        let stdout = PipeCapture::start(child.stdout.take());
        let stderr = PipeCapture::start(child.stderr.take());

        let waited = if timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait())
                .await
                .ok()
        } else {
            Some(child.wait().await)
        };

        let Some(waited) = waited else {
            if let Err(e) = child.kill().await {
                debug!(
                    subsystem = "jobs",
                    component = "runner",
                    error = %e,
                    "Failed to kill timed-out command"
                );
            }
            warn!(
                subsystem = "jobs",
                component = "runner",
                command,
                timeout_ms,
                "Command timed out"
            );
            // Keep what it printed before the kill for last_error.
            return CommandOutput {
                success: false,
                exit_code: None,
                stdout: stdout.finish(Some(KILL_DRAIN_GRACE)).await,
                stderr: stderr.finish(Some(KILL_DRAIN_GRACE)).await,
                error: Some(format!("command timed out after {timeout_ms}ms")),
            };
        };

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "runner",
                    command,
                    error = %e,
                    "Failed to wait for command"
                );
                return CommandOutput {
                    stdout: stdout.finish(Some(KILL_DRAIN_GRACE)).await,
                    stderr: stderr.finish(Some(KILL_DRAIN_GRACE)).await,
                    ..CommandOutput::failed(format!("failed to wait for command: {e}"))
                };
            }
        };

        let exit_code = status.code();
        let success = status.success();

        debug!(
            subsystem = "jobs",
            component = "runner",
            command,
            exit_code = ?exit_code,
            success,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command finished"
        );

        CommandOutput {
            success,
            exit_code,
            stdout: stdout.finish(None).await,
            stderr: stderr.finish(None).await,
            error: if success {
                None
            } else {
                Some(match exit_code {
                    Some(code) => format!("command failed with exit code {code}"),
                    None => "command terminated by signal".to_string(),
                })
            },
        }
    }
}
