//! Active runner selection.
//!
//! The choice is made once per [`RunnerSelector`] and cached; it is not
//! re-evaluated per call. A failed selection is not cached, so a later call
//! can succeed once the user fixes the installation.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{RunnerChannel, RunnerMode};
use crate::environment::EnvironmentManager;
use crate::error::SelectionError;
use crate::process::ProcessExecutor;
use crate::runner::{BackendRunner, ManagedEnvironmentRunner, PackagedExecutableRunner};

/// Chooses between the managed-environment and packaged-executable runners.
#[derive(Debug)]
pub struct RunnerSelector {
    mode: RunnerMode,
    channel: RunnerChannel,
    manager: Arc<EnvironmentManager>,
    packaged: PackagedExecutableRunner,
    executor: ProcessExecutor,
    active: OnceCell<Arc<dyn BackendRunner>>,
}

impl RunnerSelector {
    pub fn new(
        mode: RunnerMode,
        channel: RunnerChannel,
        manager: Arc<EnvironmentManager>,
        packaged: PackagedExecutableRunner,
        executor: ProcessExecutor,
    ) -> Self {
        Self {
            mode,
            channel,
            manager,
            packaged,
            executor,
            active: OnceCell::new(),
        }
    }

    pub const fn mode(&self) -> RunnerMode {
        self.mode
    }

    pub const fn channel(&self) -> RunnerChannel {
        self.channel
    }

    /// The packaged runner candidate, whether or not it was selected.
    pub const fn packaged(&self) -> &PackagedExecutableRunner {
        &self.packaged
    }

    /// The runner chosen so far, without triggering selection.
    pub fn current(&self) -> Option<Arc<dyn BackendRunner>> {
        self.active.get().map(Arc::clone)
    }

    /// The active runner, selecting it on first use.
    pub async fn active(&self) -> Result<Arc<dyn BackendRunner>, SelectionError> {
        self.active
            .get_or_try_init(|| self.select())
            .await
            .map(Arc::clone)
    }

    async fn select(&self) -> Result<Arc<dyn BackendRunner>, SelectionError> {
        if self.channel == RunnerChannel::Workspace {
            info!("Using ManagedEnvironmentRunner (workspace channel)");
            return Ok(self.managed());
        }

        match self.mode {
            RunnerMode::Venv => {
                info!("Using ManagedEnvironmentRunner (forced by setting)");
                Ok(self.managed())
            }
            RunnerMode::Exe => {
                info!("Using PackagedExecutableRunner (forced by setting)");
                if !self.packaged.health_check().await {
                    return Err(SelectionError::ExecutableUnhealthy {
                        path: self.packaged.exe_path().to_path_buf(),
                    });
                }
                Ok(Arc::new(self.packaged.clone()))
            }
            RunnerMode::Auto => {
                if self.packaged.health_check().await {
                    info!("Using PackagedExecutableRunner (auto: executable available and healthy)");
                    Ok(Arc::new(self.packaged.clone()))
                } else {
                    warn!(
                        exe = %self.packaged.exe_path().display(),
                        "Using ManagedEnvironmentRunner (auto: executable unavailable, falling back)"
                    );
                    Ok(self.managed())
                }
            }
        }
    }

    fn managed(&self) -> Arc<dyn BackendRunner> {
        Arc::new(ManagedEnvironmentRunner::new(
            Arc::clone(&self.manager),
            self.executor.clone(),
        ))
    }
}
