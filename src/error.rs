//! Error types for backend execution and environment provisioning.
//!
//! Each seam gets its own enum so callers handle the failure kinds that can
//! actually occur there. Unparseable backend output is not an error; see
//! [`crate::parse::ParsedResult::Raw`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::environment::BootstrapStep;

/// Errors raised while running a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process could not be started (binary missing, permission denied).
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process outlived its timeout and was killed.
    #[error("Command timed out after {}ms", .timeout.as_millis())]
    Timeout { command: String, timeout: Duration },

    /// Reading the process output or waiting on it failed.
    #[error("I/O error while running {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the managed environment lifecycle.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// No candidate launcher reported a Python 3 version.
    #[error("Python 3.10+ not found. Install Python or set the `{config_key}` setting")]
    InterpreterNotFound { config_key: &'static str },

    /// A bootstrap step failed; later steps did not run.
    #[error("Bootstrap step '{step}' failed: {message}")]
    BootstrapStepFailed { step: BootstrapStep, message: String },
}

/// Errors raised by a [`crate::runner::BackendRunner`] invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The managed environment has not been provisioned yet.
    #[error("Environment interpreter not found at {}. Run bootstrap first", .path.display())]
    BootstrapRequired { path: PathBuf },

    /// The packaged executable is missing from the installation.
    #[error("Backend executable not found at: {}", .path.display())]
    ExecutableNotFound { path: PathBuf },

    /// The backend ran and reported failure.
    #[error("{message}")]
    NonZeroExit { code: i32, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl RunnerError {
    /// Whether the invocation was killed for exceeding its timeout.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Process(ProcessError::Timeout { .. }))
    }
}

/// Errors raised while choosing the active runner.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// `exe` mode was forced but the packaged executable failed its health check.
    #[error(
        "Backend executable not found or unhealthy at {}. Rebuild the packaged backend or switch backend_mode to venv",
        .path.display()
    )]
    ExecutableUnhealthy { path: PathBuf },
}

/// Errors surfaced to callers of [`crate::context::BackendContext::invoke`].
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Failed to prepare workspace {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_millis() {
        let err = ProcessError::Timeout {
            command: "python".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Command timed out after 1500ms");
    }

    #[test]
    fn runner_error_detects_timeout() {
        let err = RunnerError::from(ProcessError::Timeout {
            command: "python".to_string(),
            timeout: Duration::from_secs(1),
        });
        assert!(err.is_timeout());

        let err = RunnerError::NonZeroExit {
            code: 2,
            message: "boom".to_string(),
        };
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn interpreter_not_found_names_config_key() {
        let err = EnvironmentError::InterpreterNotFound {
            config_key: "python_path",
        };
        assert!(err.to_string().contains("`python_path`"));
    }
}
