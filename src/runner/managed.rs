//! Runner for the managed virtual environment.
//!
//! Invokes `python -m cli.main <args>` with the environment's interpreter,
//! from the unpacked backend sources.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use super::{check_exit, BackendRunner, Invocation, RunnerDiagnostics, RunnerKind, PROBE_TIMEOUT};
use crate::environment::{EnvironmentManager, CLI_MODULE};
use crate::error::RunnerError;
use crate::process::{InvocationResult, ProcessExecutor};

/// Runs the backend inside the environment provisioned by [`EnvironmentManager`].
#[derive(Debug, Clone)]
pub struct ManagedEnvironmentRunner {
    manager: Arc<EnvironmentManager>,
    executor: ProcessExecutor,
}

impl ManagedEnvironmentRunner {
    pub const fn new(manager: Arc<EnvironmentManager>, executor: ProcessExecutor) -> Self {
        Self { manager, executor }
    }
}

#[async_trait]
impl BackendRunner for ManagedEnvironmentRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Venv
    }

    #[instrument(skip_all, fields(runner = "venv"))]
    async fn run(&self, invocation: Invocation) -> Result<InvocationResult, RunnerError> {
        let paths = self.manager.paths();
        if !paths.env_python.exists() {
            return Err(RunnerError::BootstrapRequired {
                path: paths.env_python,
            });
        }

        let args: Vec<String> = ["-m", CLI_MODULE]
            .into_iter()
            .map(str::to_string)
            .chain(invocation.args.iter().cloned())
            .collect();
        let options = invocation.spawn_options(&paths.backend_root);

        let result = self
            .executor
            .run(&paths.env_python, &args, &options)
            .await?;
        check_exit(result)
    }

    async fn version(&self) -> String {
        match self
            .run(Invocation::new(["--version"]).timeout(PROBE_TIMEOUT))
            .await
        {
            Ok(result) if !result.stdout.trim().is_empty() => result.stdout.trim().to_string(),
            _ => self.manager.version().to_string(),
        }
    }

    async fn health_check(&self) -> bool {
        let paths = self.manager.paths();
        if !paths.env_python.exists() || !paths.entry_point().exists() {
            return false;
        }
        self.manager.import_probe(PROBE_TIMEOUT).await
    }

    async fn diagnostics(&self) -> RunnerDiagnostics {
        let paths = self.manager.paths();
        RunnerDiagnostics::Venv {
            python_exists: paths.env_python.exists(),
            backend_exists: paths.entry_point().exists(),
            python_path: paths.env_python,
            backend_path: paths.backend_root,
            version: self.version().await,
            healthy: self.health_check().await,
        }
    }
}
