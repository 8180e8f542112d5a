//! Per-session backend handle.
//!
//! [`BackendContext`] is built once at startup and passed to every call
//! site. It owns the environment manager and the runner selector, so the
//! "select once per session" rule holds without any global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::environment::EnvironmentManager;
use crate::error::{EnvironmentError, InvokeError, SelectionError};
use crate::parse::{parse_result, ParsedResult};
use crate::process::ProcessExecutor;
use crate::runner::{
    BackendRunner, Invocation, PackagedExecutableRunner, RunnerKind, DEFAULT_TIMEOUT,
};
use crate::selector::RunnerSelector;
use crate::workspace::{backend_env, prepare_workspace, resolve_workspace};

/// A logical backend call.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// CLI arguments, e.g. `["crawl", "--paths", "/data/docs"]`.
    pub args: Vec<String>,
    /// Source folder for this call; falls back to the configured one.
    pub source_path: Option<PathBuf>,
    /// Workspace override; falls back to the configured one.
    pub workspace_override: Option<PathBuf>,
    pub timeout: Duration,
}

impl BackendRequest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            source_path: None,
            workspace_override: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn workspace_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_override = Some(path.into());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of [`BackendContext::activate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivationStatus {
    /// The active runner was usable as found.
    Ready { runner: RunnerKind },
    /// The managed environment had to be provisioned first.
    Bootstrapped { runner: RunnerKind },
    /// Something failed; commands stay available but may fail.
    Degraded { reason: String },
}

/// Explicit session handle threaded through every backend call.
#[derive(Debug)]
pub struct BackendContext {
    config: Config,
    manager: Arc<EnvironmentManager>,
    selector: RunnerSelector,
}

impl BackendContext {
    pub fn new(config: Config) -> Self {
        Self::with_executor(config, ProcessExecutor::new())
    }

    /// Build a context whose processes share `executor` (and its progress channel).
    pub fn with_executor(config: Config, executor: ProcessExecutor) -> Self {
        let manager = Arc::new(EnvironmentManager::new(
            config.storage_root(),
            config.bundle_dir(),
            executor.clone(),
        ));
        let packaged = PackagedExecutableRunner::new(&config.install_dir(), executor.clone());
        let selector = RunnerSelector::new(
            config.backend_mode,
            config.backend_channel,
            Arc::clone(&manager),
            packaged,
            executor,
        );

        Self {
            config,
            manager,
            selector,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn manager(&self) -> &Arc<EnvironmentManager> {
        &self.manager
    }

    pub const fn selector(&self) -> &RunnerSelector {
        &self.selector
    }

    /// The active runner, selected on first use and cached afterwards.
    pub async fn runner(&self) -> Result<Arc<dyn BackendRunner>, SelectionError> {
        self.selector.active().await
    }

    /// Where a call with these inputs would keep its state. Does not create it.
    pub fn workspace_for(
        &self,
        source_path: Option<&Path>,
        workspace_override: Option<&Path>,
    ) -> PathBuf {
        resolve_workspace(
            workspace_override.or(self.config.kb_workspace_path.as_deref()),
            source_path,
            self.config.source_path.as_deref(),
            &self.manager.paths().default_workspace,
        )
    }

    /// Run a backend command and parse its result.
    pub async fn invoke(&self, request: BackendRequest) -> Result<ParsedResult, InvokeError> {
        let fallback = self.manager.paths().default_workspace;
        let explicit = request
            .workspace_override
            .as_deref()
            .or(self.config.kb_workspace_path.as_deref());
        let configured_source = self.config.source_path.as_deref();

        let workspace = prepare_workspace(
            explicit,
            request.source_path.as_deref(),
            configured_source,
            &fallback,
        )
        .map_err(|source| InvokeError::Workspace {
            path: self.workspace_for(
                request.source_path.as_deref(),
                request.workspace_override.as_deref(),
            ),
            source,
        })?;

        let source = request.source_path.as_deref().or(configured_source);
        let invocation = Invocation::new(request.args)
            .envs(backend_env(&workspace, source))
            .timeout(request.timeout);

        let runner = self.runner().await?;
        let result = runner.run(invocation).await?;
        Ok(parse_result(&result.stdout))
    }

    /// Activate, then invoke regardless of the outcome. A degraded
    /// activation is logged; the call itself reports what actually fails.
    pub async fn invoke_activated(
        &self,
        request: BackendRequest,
    ) -> Result<ParsedResult, InvokeError> {
        if let ActivationStatus::Degraded { reason } = self.activate().await {
            warn!(reason = %reason, "Activation degraded, invoking anyway");
        }
        self.invoke(request).await
    }

    /// Detect an interpreter and provision the managed environment.
    pub async fn bootstrap(&self) -> Result<(), EnvironmentError> {
        let interpreter = self
            .manager
            .detect_interpreter(self.config.python_path.as_deref())
            .await?;
        self.manager.bootstrap(&interpreter).await
    }

    /// Select the runner and, for the managed environment, bootstrap it if
    /// the cheap validity check fails. Never returns an error.
    pub async fn activate(&self) -> ActivationStatus {
        let runner = match self.runner().await {
            Ok(runner) => runner,
            Err(e) => {
                warn!(error = %e, "Runner selection failed; commands may fail");
                return ActivationStatus::Degraded {
                    reason: e.to_string(),
                };
            }
        };

        let kind = runner.kind();
        if kind == RunnerKind::Exe || self.manager.is_environment_valid().await {
            info!(runner = %kind, "Backend ready");
            return ActivationStatus::Ready { runner: kind };
        }

        info!("Managed environment invalid, bootstrapping");
        match self.bootstrap().await {
            Ok(()) => ActivationStatus::Bootstrapped { runner: kind },
            Err(e) => {
                warn!(error = %e, "Bootstrap failed; commands may fail");
                ActivationStatus::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerMode;

    fn test_config(root: &Path) -> Config {
        Config {
            storage_root: Some(root.join("storage")),
            install_dir: Some(root.join("install")),
            python_path: Some(root.join("no-such-python")),
            ..Config::default()
        }
    }

    #[test]
    fn request_builder() {
        let request = BackendRequest::new(["search", "--query", "fees"])
            .source_path("/data/docs")
            .timeout(Duration::from_secs(60));
        assert_eq!(request.args, vec!["search", "--query", "fees"]);
        assert_eq!(request.source_path, Some(PathBuf::from("/data/docs")));
        assert!(request.workspace_override.is_none());
        assert_eq!(request.timeout, Duration::from_secs(60));
    }

    #[test]
    fn workspace_prefers_request_source_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.source_path = Some(PathBuf::from("/configured/docs"));
        let ctx = BackendContext::new(config);

        assert_eq!(
            ctx.workspace_for(Some(Path::new("/data/docs")), None),
            PathBuf::from("/data/docs/.kts")
        );
        assert_eq!(
            ctx.workspace_for(None, None),
            PathBuf::from("/configured/docs/.kts")
        );
    }

    #[tokio::test]
    async fn invoke_creates_workspace_before_failing_runner() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.backend_mode = RunnerMode::Venv;
        let ctx = BackendContext::new(config);
        let source = dir.path().join("docs");

        let err = ctx
            .invoke(BackendRequest::new(["status"]).source_path(&source))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InvokeError::Runner(crate::error::RunnerError::BootstrapRequired { .. })
        ));
        assert!(source.join(".kts").is_dir());
    }

    #[tokio::test]
    async fn activation_degrades_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.backend_mode = RunnerMode::Exe;
        let ctx = BackendContext::new(config);

        match ctx.activate().await {
            ActivationStatus::Degraded { reason } => {
                assert!(reason.contains("unhealthy"));
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn degraded_activation_still_invokes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.backend_mode = RunnerMode::Venv;
        let ctx = BackendContext::new(config);

        // No bundle is installed, so bootstrap fails and activation degrades.
        assert!(matches!(
            ctx.activate().await,
            ActivationStatus::Degraded { .. }
        ));

        let err = ctx
            .invoke_activated(BackendRequest::new(["status"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Runner(crate::error::RunnerError::BootstrapRequired { .. })
        ));
    }

    #[cfg(unix)]
    mod with_fake_python {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(path: &Path, body: &str) {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[tokio::test]
        async fn invalid_environment_is_bootstrapped_once() {
            let dir = tempfile::tempdir().unwrap();
            let bundle = dir.path().join("install").join("backend_bundle");
            std::fs::create_dir_all(bundle.join("cli")).unwrap();
            std::fs::write(bundle.join("cli/main.py"), "").unwrap();
            std::fs::write(bundle.join("requirements.txt"), "click\n").unwrap();

            let system_python = dir.path().join("python3");
            write_script(
                &system_python,
                r#"if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  printf '#!/bin/sh\nexit 0\n' > "$3/bin/python"
  chmod +x "$3/bin/python"
  exit 0
fi
exit 1
"#,
            );

            let mut config = test_config(dir.path());
            config.backend_mode = RunnerMode::Venv;
            config.python_path = Some(system_python);
            let ctx = BackendContext::new(config);

            assert!(!ctx.manager().is_environment_valid().await);
            assert_eq!(
                ctx.activate().await,
                ActivationStatus::Bootstrapped {
                    runner: RunnerKind::Venv
                }
            );
            assert!(ctx.manager().is_environment_valid().await);
            assert_eq!(
                ctx.activate().await,
                ActivationStatus::Ready {
                    runner: RunnerKind::Venv
                }
            );
        }
    }

    #[cfg(unix)]
    mod with_fake_exe {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn install_exe(install_dir: &Path, body: &str) {
            let exe = crate::runner::executable_path(install_dir);
            std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
            std::fs::write(&exe, format!("#!/bin/sh\n{body}")).unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[tokio::test]
        async fn invoke_parses_trailing_json_and_passes_env() {
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(dir.path());
            install_exe(
                &dir.path().join("install"),
                r#"if [ "$1" = "--version" ]; then echo "kts-backend, version 1.1.0"; exit 0; fi
echo "Scanning..." >&2
echo "Loaded 3 documents"
printf '{"command":"%s","kb":"%s","source":"%s"}\n' "$1" "$KTS_KB_PATH" "$KTS_SOURCE_PATH"
"#,
            );

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let ctx = BackendContext::with_executor(config, ProcessExecutor::with_progress(tx));
            assert_eq!(
                ctx.activate().await,
                ActivationStatus::Ready {
                    runner: RunnerKind::Exe
                }
            );

            let source = dir.path().join("docs");
            let parsed = ctx
                .invoke(BackendRequest::new(["status"]).source_path(&source))
                .await
                .unwrap();

            let value = parsed.as_value().expect("structured result");
            assert_eq!(value["command"], "status");
            assert_eq!(
                value["kb"],
                source.join(".kts").to_string_lossy().as_ref()
            );
            assert_eq!(value["source"], source.to_string_lossy().as_ref());

            drop(ctx);
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            assert!(lines.contains(&"Scanning...".to_string()));
        }

        #[tokio::test]
        async fn invoke_surfaces_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(dir.path());
            install_exe(
                &dir.path().join("install"),
                "if [ \"$1\" = \"--version\" ]; then echo 1.1.0; exit 0; fi\nsleep 5\n",
            );
            let ctx = BackendContext::new(config);

            let err = ctx
                .invoke(BackendRequest::new(["crawl"]).timeout(Duration::from_millis(100)))
                .await
                .unwrap_err();
            match err {
                InvokeError::Runner(e) => assert!(e.is_timeout()),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
