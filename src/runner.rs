//! Backend runner trait and implementations.
//!
//! A runner knows how to turn logical backend arguments into a concrete
//! command line: either inside the managed virtual environment or via the
//! self-contained packaged executable. Process handling is delegated to
//! [`ProcessExecutor`](crate::process::ProcessExecutor).

mod managed;
mod packaged;

pub use managed::ManagedEnvironmentRunner;
pub use packaged::{executable_path, platform_dir, PackagedExecutableRunner};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RunnerError;
use crate::process::{InvocationResult, SpawnOptions};

/// Upper bound for indexing operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Typical bound for read-only operations (status, search).
pub const READ_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Typical bound for ingest operations.
pub const INGEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Bound for version and health probes.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which runner variant is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Managed virtual environment.
    Venv,
    /// Packaged executable.
    Exe,
}

impl RunnerKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Venv => "ManagedEnvironmentRunner",
            Self::Exe => "PackagedExecutableRunner",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single backend call. Built per call and not retained.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Logical CLI arguments, appended to the runner's entry point.
    pub args: Vec<String>,
    /// Variables layered over the parent environment.
    pub env: HashMap<String, String>,
    /// Working directory; each runner has its own default.
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn_options(&self, default_cwd: &Path) -> SpawnOptions {
        SpawnOptions {
            cwd: Some(self.cwd.clone().unwrap_or_else(|| default_cwd.to_path_buf())),
            env: self.env.clone(),
            timeout: self.timeout,
        }
    }
}

/// Runner-specific diagnostics, tagged by mode.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RunnerDiagnostics {
    Venv {
        python_path: PathBuf,
        backend_path: PathBuf,
        python_exists: bool,
        backend_exists: bool,
        version: String,
        healthy: bool,
    },
    Exe {
        exe_path: PathBuf,
        exe_exists: bool,
        version: String,
        healthy: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        exe_size: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exe_modified: Option<String>,
    },
}

/// Common contract for executing the backend CLI.
#[async_trait]
pub trait BackendRunner: Send + Sync + fmt::Debug {
    fn kind(&self) -> RunnerKind;

    /// Run the backend with `invocation.args`.
    ///
    /// A non-zero exit becomes [`RunnerError::NonZeroExit`] carrying the
    /// tail of stderr.
    async fn run(&self, invocation: Invocation) -> Result<InvocationResult, RunnerError>;

    /// Backend version string; never fails.
    async fn version(&self) -> String;

    /// Whether the backend looks usable, without running a real operation.
    async fn health_check(&self) -> bool;

    async fn diagnostics(&self) -> RunnerDiagnostics;
}

fn check_exit(result: InvocationResult) -> Result<InvocationResult, RunnerError> {
    if result.success() {
        Ok(result)
    } else {
        Err(RunnerError::NonZeroExit {
            code: result.exit_code,
            message: result.failure_message(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_defaults_to_long_timeout() {
        let invocation = Invocation::new(["status"]);
        assert_eq!(invocation.args, vec!["status"]);
        assert_eq!(invocation.timeout, DEFAULT_TIMEOUT);
        assert!(invocation.env.is_empty());
    }

    #[test]
    fn spawn_options_use_runner_default_cwd() {
        let options = Invocation::new(["status"])
            .env("KTS_KB_PATH", "/kb")
            .timeout(READ_TIMEOUT)
            .spawn_options(Path::new("/opt/backend"));
        assert_eq!(options.cwd.as_deref(), Some(Path::new("/opt/backend")));
        assert_eq!(options.env["KTS_KB_PATH"], "/kb");
        assert_eq!(options.timeout, READ_TIMEOUT);

        let options = Invocation::new(["status"])
            .cwd("/work")
            .spawn_options(Path::new("/opt/backend"));
        assert_eq!(options.cwd.as_deref(), Some(Path::new("/work")));
    }

    #[test]
    fn check_exit_maps_failure() {
        let ok = InvocationResult {
            stdout: "{}".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(check_exit(ok).is_ok());

        let failed = InvocationResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 2,
        };
        match check_exit(failed) {
            Err(RunnerError::NonZeroExit { code, message }) => {
                assert_eq!(code, 2);
                assert_eq!(message, "Command failed with exit code 2");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn diagnostics_serialize_with_mode_tag() {
        let diag = RunnerDiagnostics::Exe {
            exe_path: PathBuf::from("/opt/kts-backend"),
            exe_exists: false,
            version: "unknown".to_string(),
            healthy: false,
            exe_size: None,
            exe_modified: None,
        };
        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["mode"], "exe");
        assert!(json.get("exe_size").is_none());
    }
}
