//! Managed Python environment lifecycle.
//!
//! Everything lives under a storage root and is keyed by the bundled backend
//! version, so an upgrade never reuses a stale install:
//!
//! ```text
//! <root>/env/<version>/        virtual environment
//! <root>/backend/<version>/    unpacked backend sources (entry: cli/main.py)
//! <root>/workspace/default/    fallback persisted workspace
//! ```
//!
//! Bootstrap is destructive: each step replaces its target wholesale. A
//! partially bootstrapped directory is never patched; it fails
//! [`EnvironmentManager::is_environment_valid`] and gets rebuilt.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::EnvironmentError;
use crate::process::{ProcessExecutor, SpawnOptions};

/// Config key users set to point at a specific interpreter.
pub const PYTHON_PATH_KEY: &str = "python_path";

/// Module run as the backend CLI.
pub const CLI_MODULE: &str = "cli.main";

const VERSION_FILE: &str = "backend_version.json";
const FALLBACK_VERSION: &str = "1.0.0";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const REQUIRED_VERSION_MARKER: &str = "Python 3.";

const IMPORT_PROBE: &str = "import backend, cli";
const HEALTH_IMPORTS: &str = "import cli, backend, config; print(\"Imports OK\")";

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const VENV_TIMEOUT: Duration = Duration::from_secs(60);
const PIP_UPGRADE_TIMEOUT: Duration = Duration::from_secs(120);
const PIP_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// A launcher that can run Python, possibly with fixed leading arguments
/// (the Windows `py -3` launcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    program: PathBuf,
    prefix_args: Vec<String>,
}

impl Interpreter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<PathBuf>, prefix_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument list: the launcher prefix followed by `rest`.
    pub fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args
            .iter()
            .cloned()
            .chain(rest.into_iter().map(Into::into))
            .collect()
    }

    /// Launchers to probe, in preference order for this platform.
    pub fn platform_candidates() -> Vec<Self> {
        if cfg!(windows) {
            vec![Self::with_args("py", ["-3"]), Self::new("python")]
        } else {
            vec![Self::new("python3"), Self::new("python")]
        }
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.prefix_args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Version-keyed storage locations, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentPaths {
    pub storage_root: PathBuf,
    pub env_root: PathBuf,
    pub backend_root: PathBuf,
    pub default_workspace: PathBuf,
    /// Interpreter inside the virtual environment.
    pub env_python: PathBuf,
}

impl EnvironmentPaths {
    pub fn new(storage_root: &Path, version: &str) -> Self {
        let env_root = storage_root.join("env").join(version);
        let env_python = if cfg!(windows) {
            env_root.join("Scripts").join("python.exe")
        } else {
            env_root.join("bin").join("python")
        };

        Self {
            storage_root: storage_root.to_path_buf(),
            backend_root: storage_root.join("backend").join(version),
            default_workspace: storage_root.join("workspace").join("default"),
            env_root,
            env_python,
        }
    }

    /// Backend CLI entry point inside the unpacked sources.
    pub fn entry_point(&self) -> PathBuf {
        self.backend_root.join("cli").join("main.py")
    }

    pub fn requirements(&self) -> PathBuf {
        self.backend_root.join(REQUIREMENTS_FILE)
    }
}

/// Ordered bootstrap steps, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStep {
    PrepareDirectories,
    UnpackBackend,
    CreateEnvironment,
    InstallDependencies,
    HealthProbe,
}

impl BootstrapStep {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PrepareDirectories => "prepare directories",
            Self::UnpackBackend => "unpack backend",
            Self::CreateEnvironment => "create environment",
            Self::InstallDependencies => "install dependencies",
            Self::HealthProbe => "health probe",
        }
    }

    fn failed(self, message: impl fmt::Display) -> EnvironmentError {
        EnvironmentError::BootstrapStepFailed {
            step: self,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort environment report. Fallible fields degrade to an
/// `Error: ...` string instead of failing the whole report.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentDiagnostics {
    pub backend_version: String,
    pub interpreter_detected: Option<String>,
    pub interpreter_path: Option<PathBuf>,
    pub interpreter_version: Option<String>,
    pub env_exists: bool,
    pub env_python: PathBuf,
    pub backend_exists: bool,
    pub backend_path: PathBuf,
    pub workspace_path: PathBuf,
    pub workspace_exists: bool,
    /// Short fingerprint of the installed package listing.
    pub installed_packages: Option<String>,
    pub health_check: bool,
}

#[derive(Debug, Deserialize)]
struct VersionMetadata {
    #[serde(default)]
    version: Option<String>,
}

/// Read the backend version from the bundle metadata, falling back to a
/// fixed default when it is missing or malformed.
pub fn read_backend_version(bundle_dir: &Path) -> String {
    let path = bundle_dir.join(VERSION_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No backend version metadata");
            return FALLBACK_VERSION.to_string();
        }
    };

    match serde_json::from_str::<VersionMetadata>(&contents) {
        Ok(meta) => meta
            .version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_VERSION.to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read backend version");
            FALLBACK_VERSION.to_string()
        }
    }
}

/// Short hex digest of a dependency listing, for drift detection.
pub fn dependency_fingerprint(listing: &str) -> String {
    let digest = format!("{:x}", md5::compute(listing.as_bytes()));
    digest[..8].to_string()
}

/// Owns discovery, provisioning and health of the managed environment.
#[derive(Debug)]
pub struct EnvironmentManager {
    storage_root: PathBuf,
    bundle_dir: PathBuf,
    version: String,
    executor: ProcessExecutor,
}

impl EnvironmentManager {
    /// Create a manager; the backend version is read once from `bundle_dir`.
    pub fn new(
        storage_root: impl Into<PathBuf>,
        bundle_dir: impl Into<PathBuf>,
        executor: ProcessExecutor,
    ) -> Self {
        let bundle_dir = bundle_dir.into();
        let version = read_backend_version(&bundle_dir);
        Self {
            storage_root: storage_root.into(),
            bundle_dir,
            version,
            executor,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn paths(&self) -> EnvironmentPaths {
        EnvironmentPaths::new(&self.storage_root, &self.version)
    }

    /// Find a Python 3 interpreter, honouring an explicit path first.
    pub async fn detect_interpreter(
        &self,
        explicit: Option<&Path>,
    ) -> Result<Interpreter, EnvironmentError> {
        self.detect_interpreter_from(explicit, &Interpreter::platform_candidates())
            .await
    }

    /// Like [`Self::detect_interpreter`] with an explicit candidate list.
    pub async fn detect_interpreter_from(
        &self,
        explicit: Option<&Path>,
        candidates: &[Interpreter],
    ) -> Result<Interpreter, EnvironmentError> {
        if let Some(path) = explicit.filter(|p| p.exists()) {
            debug!(path = %path.display(), "Using configured interpreter");
            return Ok(Interpreter::new(path));
        }

        for candidate in candidates {
            match self.query_version(candidate).await {
                Some(version) if version.contains(REQUIRED_VERSION_MARKER) => {
                    info!(interpreter = %candidate, version = %version, "Detected interpreter");
                    return Ok(candidate.clone());
                }
                Some(version) => {
                    debug!(interpreter = %candidate, version = %version, "Skipping interpreter: wrong major version");
                }
                None => {
                    debug!(interpreter = %candidate, "Skipping interpreter: version query failed");
                }
            }
        }

        Err(EnvironmentError::InterpreterNotFound {
            config_key: PYTHON_PATH_KEY,
        })
    }

    /// Run `--version`; Python 2 prints it to stderr, so both are checked.
    async fn query_version(&self, interpreter: &Interpreter) -> Option<String> {
        let options = SpawnOptions::new().timeout(VERSION_QUERY_TIMEOUT);
        let result = self
            .executor
            .run(interpreter.program(), &interpreter.args(["--version"]), &options)
            .await
            .ok()?;
        if !result.success() {
            return None;
        }
        let version = if result.stdout.trim().is_empty() {
            result.stderr.trim()
        } else {
            result.stdout.trim()
        };
        Some(version.to_string())
    }

    /// Cheap validity check; safe to call often and never mutates state.
    pub async fn is_environment_valid(&self) -> bool {
        let paths = self.paths();
        if !paths.env_python.exists() {
            debug!(path = %paths.env_python.display(), "Environment interpreter missing");
            return false;
        }
        if !paths.entry_point().exists() {
            debug!(path = %paths.entry_point().display(), "Backend entry point missing");
            return false;
        }
        self.import_probe(HEALTH_TIMEOUT).await
    }

    /// Import the backend's top-level modules inside the environment.
    pub async fn import_probe(&self, timeout: Duration) -> bool {
        let paths = self.paths();
        let options = SpawnOptions::new()
            .cwd(&paths.backend_root)
            .timeout(timeout);
        let args = vec!["-c".to_string(), IMPORT_PROBE.to_string()];
        matches!(
            self.executor.run(&paths.env_python, &args, &options).await,
            Ok(result) if result.success()
        )
    }

    /// Provision the environment from scratch.
    ///
    /// Steps run in order and the first failure aborts the rest. Whatever
    /// was left behind fails [`Self::is_environment_valid`], so the next
    /// attempt starts clean.
    pub async fn bootstrap(&self, interpreter: &Interpreter) -> Result<(), EnvironmentError> {
        info!(version = %self.version, interpreter = %interpreter, "Starting bootstrap");
        let paths = self.paths();

        prepare_directories(&paths).map_err(|e| BootstrapStep::PrepareDirectories.failed(e))?;
        self.unpack_backend(&paths).await?;
        self.create_environment(interpreter, &paths).await?;
        self.install_dependencies(&paths).await?;
        self.health_probe(&paths).await?;

        info!("Bootstrap complete");
        Ok(())
    }

    async fn unpack_backend(&self, paths: &EnvironmentPaths) -> Result<(), EnvironmentError> {
        let step = BootstrapStep::UnpackBackend;
        info!(target_dir = %paths.backend_root.display(), "Unpacking backend");

        if !self.bundle_dir.is_dir() {
            return Err(step.failed(format!(
                "Backend bundle not found at {}. The installation may be corrupted",
                self.bundle_dir.display()
            )));
        }

        let source = self.bundle_dir.clone();
        let target = paths.backend_root.clone();
        tokio::task::spawn_blocking(move || replace_tree(&source, &target))
            .await
            .map_err(|e| step.failed(e))?
            .map_err(|e| step.failed(e))?;

        debug!("Backend unpacked");
        Ok(())
    }

    async fn create_environment(
        &self,
        interpreter: &Interpreter,
        paths: &EnvironmentPaths,
    ) -> Result<(), EnvironmentError> {
        let step = BootstrapStep::CreateEnvironment;
        info!(env_root = %paths.env_root.display(), "Creating virtual environment");

        if paths.env_root.exists() {
            fs::remove_dir_all(&paths.env_root).map_err(|e| step.failed(e))?;
        }

        let args = interpreter.args([
            "-m".to_string(),
            "venv".to_string(),
            paths.env_root.to_string_lossy().into_owned(),
        ]);
        self.run_step(step, interpreter.program(), args, None, VENV_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn install_dependencies(&self, paths: &EnvironmentPaths) -> Result<(), EnvironmentError> {
        let step = BootstrapStep::InstallDependencies;
        info!("Installing dependencies");

        let requirements = paths.requirements();
        if !requirements.exists() {
            return Err(step.failed(format!(
                "{REQUIREMENTS_FILE} not found in backend bundle"
            )));
        }

        let python = &paths.env_python;
        self.run_step(
            step,
            python,
            pip_args(["install", "--upgrade", "pip"]),
            None,
            PIP_UPGRADE_TIMEOUT,
        )
        .await?;

        let mut install = pip_args(["install", "-r"]);
        install.push(requirements.to_string_lossy().into_owned());
        self.run_step(step, python, install, None, PIP_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn health_probe(&self, paths: &EnvironmentPaths) -> Result<(), EnvironmentError> {
        let step = BootstrapStep::HealthProbe;
        info!("Running health probe");

        let python = &paths.env_python;
        let cwd = Some(paths.backend_root.as_path());
        self.run_step(
            step,
            python,
            vec!["-c".to_string(), HEALTH_IMPORTS.to_string()],
            cwd,
            HEALTH_TIMEOUT,
        )
        .await?;
        self.run_step(
            step,
            python,
            vec!["-m".to_string(), CLI_MODULE.to_string(), "--help".to_string()],
            cwd,
            HEALTH_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Run one command of a bootstrap step; a non-zero exit fails the step.
    async fn run_step(
        &self,
        step: BootstrapStep,
        program: &Path,
        args: Vec<String>,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<String, EnvironmentError> {
        let mut options = SpawnOptions::new().timeout(timeout);
        if let Some(cwd) = cwd {
            options = options.cwd(cwd);
        }

        let result = self
            .executor
            .run(program, &args, &options)
            .await
            .map_err(|e| step.failed(e))?;
        if !result.success() {
            return Err(step.failed(result.failure_message()));
        }
        Ok(result.stdout)
    }

    /// Aggregate a diagnostics report without failing on any single field.
    pub async fn diagnostics(&self, explicit: Option<&Path>) -> EnvironmentDiagnostics {
        let paths = self.paths();
        let env_exists = paths.env_python.exists();

        let mut report = EnvironmentDiagnostics {
            backend_version: self.version.clone(),
            interpreter_detected: None,
            interpreter_path: None,
            interpreter_version: None,
            env_exists,
            env_python: paths.env_python.clone(),
            backend_exists: paths.entry_point().exists(),
            backend_path: paths.backend_root.clone(),
            workspace_exists: paths.default_workspace.exists(),
            workspace_path: paths.default_workspace.clone(),
            installed_packages: None,
            health_check: false,
        };

        match self.detect_interpreter(explicit).await {
            Ok(interpreter) => {
                report.interpreter_path = which::which(interpreter.program()).ok();
                report.interpreter_version = Some(
                    self.query_version(&interpreter)
                        .await
                        .unwrap_or_else(|| "Error: version query failed".to_string()),
                );
                report.interpreter_detected = Some(interpreter.to_string());
            }
            Err(e) => report.interpreter_version = Some(format!("Error: {e}")),
        }

        if env_exists {
            let list_args = pip_args(["list", "--format=freeze"]);
            report.installed_packages = Some(
                match self
                    .executor
                    .run(&paths.env_python, &list_args, &SpawnOptions::new())
                    .await
                {
                    Ok(result) if result.success() => dependency_fingerprint(&result.stdout),
                    _ => "Error reading packages".to_string(),
                },
            );
            report.health_check = self.import_probe(HEALTH_TIMEOUT).await;
        }

        report
    }
}

fn pip_args<const N: usize>(rest: [&str; N]) -> Vec<String> {
    ["-m", "pip"]
        .into_iter()
        .chain(rest)
        .map(str::to_string)
        .collect()
}

fn prepare_directories(paths: &EnvironmentPaths) -> io::Result<()> {
    for dir in [
        &paths.storage_root,
        &paths.env_root,
        &paths.backend_root,
        &paths.default_workspace,
    ] {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Remove `target` if present, then copy `source` into it recursively.
fn replace_tree(source: &Path, target: &Path) -> io::Result<()> {
    if target.exists() {
        fs::remove_dir_all(target)?;
    }

    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let dest = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
