//! Child process execution with a hard timeout.
//!
//! stderr is treated as a progress channel: every line is forwarded the
//! moment it arrives. stdout is the result channel and is buffered in full,
//! since it is expected to end in a single JSON document.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::error::ProcessError;

/// Default bound for helper commands (version probes, imports).
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest stdout prefix echoed to the log after a run.
const MAX_LOGGED_STDOUT: usize = 5000;

/// Number of trailing stderr lines kept in failure messages.
const FAILURE_TAIL_LINES: usize = 20;

/// Raw outcome of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code of the process (0 = success, -1 if killed by a signal).
    pub exit_code: i32,
}

impl InvocationResult {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Explanation for a failed run: the tail of stderr, or the exit code
    /// when stderr is empty.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            return format!("Command failed with exit code {}", self.exit_code);
        }
        let lines: Vec<&str> = stderr.lines().collect();
        let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Per-spawn settings.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Working directory; inherits the parent's when `None`.
    pub cwd: Option<PathBuf>,
    /// Variables layered over the parent environment.
    pub env: HashMap<String, String>,
    /// Hard upper bound on the child's lifetime.
    pub timeout: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
            timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Spawns commands and collects their output.
///
/// Progress lines from stderr go to `tracing` and, when configured, to a
/// subscriber channel so callers can render them without coupling the
/// executor to a particular sink.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    progress: Option<UnboundedSender<String>>,
}

impl ProcessExecutor {
    /// Create an executor that only logs progress lines.
    #[must_use]
    pub const fn new() -> Self {
        Self { progress: None }
    }

    /// Create an executor that also forwards each stderr line to `progress`.
    #[must_use]
    pub const fn with_progress(progress: UnboundedSender<String>) -> Self {
        Self {
            progress: Some(progress),
        }
    }

    /// Run `program` to completion or until `options.timeout` elapses.
    ///
    /// A non-zero exit is not an error here; it is reported through
    /// [`InvocationResult::exit_code`]. On timeout the child is killed and
    /// reaped before the error is returned.
    #[instrument(skip(self, args, options), fields(program = %program.display(), timeout_ms = %options.timeout.as_millis()))]
    pub async fn run(
        &self,
        program: &Path,
        args: &[String],
        options: &SpawnOptions,
    ) -> Result<InvocationResult, ProcessError> {
        let command = program.display().to_string();
        info!(args = ?args, "Executing {command}");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;

        let io_error = |source: io::Error| ProcessError::Io {
            command: command.clone(),
            source,
        };

        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(io::Error::other("stdout was not captured")))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(io::Error::other("stderr was not captured")))?;

        // `child` is only borrowed here so it can still be killed on timeout.
        let progress = self.progress.as_ref();
        let read_all = async {
            let mut stdout_buf = Vec::new();
            let (stdout_read, stderr_read) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                forward_stderr(child_stderr, progress),
            );
            stdout_read?;
            let stderr_text = stderr_read?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout_buf, stderr_text))
        };

        let (status, stdout_buf, stderr) =
            match tokio::time::timeout(options.timeout, read_all).await {
                Ok(Ok(done)) => done,
                Ok(Err(source)) => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill process after I/O error");
                    }
                    return Err(io_error(source));
                }
                Err(_) => {
                    warn!("Timeout, killing process");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill timed out process");
                    }
                    return Err(ProcessError::Timeout {
                        command,
                        timeout: options.timeout,
                    });
                }
            };

        let result = InvocationResult {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr,
            exit_code: status.code().unwrap_or(-1),
        };

        info!(exit_code = result.exit_code, "Process exited");
        log_stdout(&result.stdout);

        Ok(result)
    }
}

/// Read stderr line by line, forwarding each non-blank line immediately.
/// Returns the full text for failure reporting.
async fn forward_stderr(
    stderr: ChildStderr,
    progress: Option<&UnboundedSender<String>>,
) -> io::Result<String> {
    let mut reader = BufReader::new(stderr);
    let mut collected = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let chunk = String::from_utf8_lossy(&buf);
        collected.push_str(&chunk);

        let line = chunk.trim_end_matches(|c: char| c == '\r' || c == '\n');
        if line.trim().is_empty() {
            continue;
        }
        debug!(target: "kts_runner::backend", "{line}");
        if let Some(tx) = progress {
            // Subscriber may have gone away; the run itself is unaffected.
            let _ = tx.send(line.to_owned());
        }
    }

    Ok(collected)
}

fn log_stdout(stdout: &str) {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed.len() > MAX_LOGGED_STDOUT {
        let head: String = trimmed.chars().take(MAX_LOGGED_STDOUT).collect();
        debug!("Output (truncated): {head}...");
    } else {
        debug!("Output: {trimmed}");
    }
}
