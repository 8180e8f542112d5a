//! Runner for the self-contained packaged backend executable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::{check_exit, BackendRunner, Invocation, RunnerDiagnostics, RunnerKind, PROBE_TIMEOUT};
use crate::error::RunnerError;
use crate::process::{InvocationResult, ProcessExecutor, SpawnOptions};

const EXECUTABLE_NAME: &str = "kts-backend";

/// Platform/architecture directory name, e.g. `win-x64` or `darwin-arm64`.
pub fn platform_dir() -> String {
    let os = match std::env::consts::OS {
        "windows" => "win",
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}

/// Location of the packaged executable relative to an installation.
pub fn executable_path(install_dir: &Path) -> PathBuf {
    install_dir
        .join("bin")
        .join(platform_dir())
        .join(EXECUTABLE_NAME)
        .join(format!("{EXECUTABLE_NAME}{}", std::env::consts::EXE_SUFFIX))
}

/// Invokes the packaged executable directly.
#[derive(Debug, Clone)]
pub struct PackagedExecutableRunner {
    exe_path: PathBuf,
    executor: ProcessExecutor,
}

impl PackagedExecutableRunner {
    /// Runner for the executable shipped inside `install_dir`.
    pub fn new(install_dir: &Path, executor: ProcessExecutor) -> Self {
        Self::with_executable(executable_path(install_dir), executor)
    }

    /// Runner for an executable at an explicit path.
    pub fn with_executable(exe_path: impl Into<PathBuf>, executor: ProcessExecutor) -> Self {
        Self {
            exe_path: exe_path.into(),
            executor,
        }
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    fn exe_dir(&self) -> &Path {
        self.exe_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[async_trait]
impl BackendRunner for PackagedExecutableRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exe
    }

    #[instrument(skip_all, fields(runner = "exe", exe = %self.exe_path.display()))]
    async fn run(&self, invocation: Invocation) -> Result<InvocationResult, RunnerError> {
        if !self.exe_path.exists() {
            return Err(RunnerError::ExecutableNotFound {
                path: self.exe_path.clone(),
            });
        }

        let options = invocation.spawn_options(self.exe_dir());
        let result = self
            .executor
            .run(&self.exe_path, &invocation.args, &options)
            .await?;
        check_exit(result)
    }

    async fn version(&self) -> String {
        match self
            .run(Invocation::new(["--version"]).timeout(PROBE_TIMEOUT))
            .await
        {
            Ok(result) => result.stdout.trim().to_string(),
            Err(_) => "unknown".to_string(),
        }
    }

    async fn health_check(&self) -> bool {
        if !self.exe_path.exists() {
            return false;
        }
        let options = SpawnOptions::new().timeout(PROBE_TIMEOUT);
        self.executor
            .run(&self.exe_path, &["--version".to_string()], &options)
            .await
            .is_ok_and(|result| result.success())
    }

    async fn diagnostics(&self) -> RunnerDiagnostics {
        let metadata = std::fs::metadata(&self.exe_path).ok();
        #[allow(clippy::cast_precision_loss)]
        let exe_size = metadata
            .as_ref()
            .map(|m| format!("{:.2} MB", m.len() as f64 / 1024.0 / 1024.0));
        let exe_modified = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

        RunnerDiagnostics::Exe {
            exe_path: self.exe_path.clone(),
            exe_exists: metadata.is_some(),
            version: self.version().await,
            healthy: self.health_check().await,
            exe_size,
            exe_modified,
        }
    }
}
