//! Shell command execution with a hard wall-clock timeout.
//!
//! Every command goes through `sh -c` in a given working directory. Output is
//! captured up to `MAX_OUTPUT_BYTES` per stream. A command that outlives its
//! timeout is killed and reaped, and reported as `CommandOutcome::TimedOut`
//! rather than as an exit code.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Interval between heartbeat log lines while a command is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain window after a kill. Grandchildren may still hold the pipes open.
const KILLED_CAPTURE_TIMEOUT: Duration = Duration::from_millis(250);

/// Maximum bytes captured per stream.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration: Duration,
    },
    /// Killed after exceeding the timeout. Partial output is kept.
    TimedOut {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Completed { exit_code: 0, .. })
    }
}

/// A command and everything needed to spawn it.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand<'a> {
    pub command: &'a str,
    /// Written to stdin, which is closed afterwards. `None` attaches /dev/null.
    pub stdin: Option<&'a str>,
    pub env: Vec<(&'a str, String)>,
}

impl<'a> ShellCommand<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, input: &'a str) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn with_env(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.env.push((key, value.into()));
        self
    }
}

/// Runs shell commands under a fixed timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `command` in `cwd`.
    pub async fn run(&self, command: &str, cwd: &Path) -> std::io::Result<CommandOutcome> {
        self.run_shell(&ShellCommand::new(command), cwd).await
    }

    /// Run a fully described command in `cwd`.
    ///
    /// Errors only when the shell cannot be spawned or waited on; a command
    /// that runs and fails is a `Completed` outcome with its exit code.
    pub async fn run_shell(
        &self,
        shell: &ShellCommand<'_>,
        cwd: &Path,
    ) -> std::io::Result<CommandOutcome> {
        debug!(cmd = %shell.command, cwd = %cwd.display(), "spawning command");

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(shell.command)
            .current_dir(cwd)
            .stdin(if shell.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &shell.env {
            process.env(key, value);
        }

        let started = Instant::now();
        let mut child = process.spawn()?;

        let stdin_task = match (child.stdin.take(), shell.stdin) {
            (Some(mut pipe), Some(input)) => {
                let input = input.to_string();
                Some(tokio::spawn(async move {
                    pipe.write_all(input.as_bytes()).await?;
                    pipe.shutdown().await
                }))
            }
            _ => None,
        };
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let status = loop {
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                warn!(
                    cmd = %shell.command,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "command timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(cmd = %shell.command, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break None;
            }

            let sleep_duration = HEARTBEAT_INTERVAL.min(self.timeout - elapsed);

            tokio::select! {
                result = child.wait() => break Some(result?),
                () = tokio::time::sleep(sleep_duration) => {
                    if started.elapsed() < self.timeout {
                        info!(
                            cmd = %shell.command,
                            elapsed_sec = started.elapsed().as_secs(),
                            timeout_sec = self.timeout.as_secs(),
                            "command still running"
                        );
                    }
                }
            }
        };

        let capture_timeout = if status.is_some() {
            IO_CAPTURE_TIMEOUT
        } else {
            KILLED_CAPTURE_TIMEOUT
        };
        if let Some(task) = stdin_task {
            let abort = task.abort_handle();
            match timeout(capture_timeout, task).await {
                Ok(Ok(Err(err))) if err.kind() != std::io::ErrorKind::BrokenPipe => {
                    warn!(cmd = %shell.command, error = %err, "writing stdin failed");
                }
                Err(_) => abort.abort(),
                _ => {}
            }
        }
        let stdout = collect_output(stdout_task, capture_timeout, shell.command, "stdout").await;
        let stderr = collect_output(stderr_task, capture_timeout, shell.command, "stderr").await;

        let outcome = match status {
            Some(status) => {
                let exit_code = status.code().unwrap_or(-1);
                let duration = started.elapsed();
                debug!(
                    cmd = %shell.command,
                    exit_code,
                    duration_ms = duration.as_millis() as u64,
                    "command finished"
                );
                CommandOutcome::Completed {
                    exit_code,
                    stdout,
                    stderr,
                    duration,
                }
            }
            None => CommandOutcome::TimedOut {
                timeout: self.timeout,
                stdout,
                stderr,
            },
        };
        Ok(outcome)
    }
}

/// Human-readable timeout, whole seconds when possible.
pub fn describe_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} ms", timeout.as_millis())
    }
}

/// Read from an async reader with a maximum byte limit, draining the rest.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn collect_output(
    task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    capture_timeout: Duration,
    cmd: &str,
    stream: &'static str,
) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let abort = task.abort_handle();
    let bytes = match timeout(capture_timeout, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(cmd, stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(cmd, stream, error = %err, "output task panicked");
            Vec::new()
        }
        Err(_) => {
            abort.abort();
            debug!(cmd, stream, "output capture timed out");
            Vec::new()
        }
    };
    String::from_utf8_lossy(&bytes).into_owned()
}
