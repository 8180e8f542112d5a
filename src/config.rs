//! Runner configuration.
//!
//! A JSON document may be passed via the `KTS_RUNNER_CONFIG` environment
//! variable. Individual settings can then be overridden by dedicated
//! environment variables, which take priority over the JSON values.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable carrying the JSON configuration document.
pub const CONFIG_ENV: &str = "KTS_RUNNER_CONFIG";

const SOURCE_PATH_ENV: &str = "KTS_SOURCE_PATH";
const KB_WORKSPACE_ENV: &str = "KTS_KB_WORKSPACE";
const PYTHON_PATH_ENV: &str = "KTS_PYTHON_PATH";
const BACKEND_MODE_ENV: &str = "KTS_BACKEND_MODE";
const BACKEND_CHANNEL_ENV: &str = "KTS_BACKEND_CHANNEL";

const STORAGE_DIR_NAME: &str = "kts-runner";
const BUNDLE_DIR_NAME: &str = "backend_bundle";

/// Which backend variant to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    /// Use the packaged executable when healthy, else the managed environment.
    #[default]
    Auto,
    /// Always use the managed environment.
    #[serde(alias = "managed-environment")]
    Venv,
    /// Always use the packaged executable; fail if it is unhealthy.
    #[serde(alias = "packaged-executable")]
    Exe,
}

impl RunnerMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Venv => "venv",
            Self::Exe => "exe",
        }
    }
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "venv" | "managed-environment" => Ok(Self::Venv),
            "exe" | "packaged-executable" => Ok(Self::Exe),
            other => anyhow::bail!("Invalid backend mode '{other}' (expected auto|venv|exe)"),
        }
    }
}

/// Where the backend comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerChannel {
    /// The backend shipped with this installation.
    #[default]
    Bundled,
    /// Development flow against the live environment.
    #[serde(alias = "workspace-dev")]
    Workspace,
}

impl RunnerChannel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bundled => "bundled",
            Self::Workspace => "workspace",
        }
    }
}

impl fmt::Display for RunnerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerChannel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bundled" => Ok(Self::Bundled),
            "workspace" | "workspace-dev" => Ok(Self::Workspace),
            other => anyhow::bail!("Invalid backend channel '{other}' (expected bundled|workspace)"),
        }
    }
}

/// Top-level configuration for the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Document source folder; the default workspace derives from it.
    #[serde(default)]
    pub source_path: Option<PathBuf>,

    /// Explicit persisted-state directory, used when it exists.
    #[serde(default)]
    pub kb_workspace_path: Option<PathBuf>,

    /// Interpreter to use instead of auto-detection.
    #[serde(default)]
    pub python_path: Option<PathBuf>,

    #[serde(default)]
    pub backend_mode: RunnerMode,

    #[serde(default)]
    pub backend_channel: RunnerChannel,

    /// Root for versioned environments; defaults to the user data directory.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,

    /// Installation directory holding `bin/` and `backend_bundle/`.
    /// Defaults to the directory of the running executable.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    /// Bundled backend sources; defaults to `<install_dir>/backend_bundle`.
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `KTS_RUNNER_CONFIG` plus per-setting overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(json) => serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse {CONFIG_ENV}"))?,
            Err(_) => {
                debug!("{CONFIG_ENV} not set, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(SOURCE_PATH_ENV) {
            self.source_path = Some(path.into());
        }
        if let Some(path) = get(KB_WORKSPACE_ENV) {
            self.kb_workspace_path = Some(path.into());
        }
        if let Some(path) = get(PYTHON_PATH_ENV) {
            self.python_path = Some(path.into());
        }
        if let Some(mode) = get(BACKEND_MODE_ENV) {
            self.backend_mode = mode
                .parse()
                .with_context(|| format!("Invalid {BACKEND_MODE_ENV}"))?;
        }
        if let Some(channel) = get(BACKEND_CHANNEL_ENV) {
            self.backend_channel = channel
                .parse()
                .with_context(|| format!("Invalid {BACKEND_CHANNEL_ENV}"))?;
        }
        Ok(())
    }

    /// Storage root for versioned environments.
    pub fn storage_root(&self) -> PathBuf {
        self.storage_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(STORAGE_DIR_NAME)
        })
    }

    /// Installation directory.
    pub fn install_dir(&self) -> PathBuf {
        self.install_dir.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// Bundled backend source tree.
    pub fn bundle_dir(&self) -> PathBuf {
        self.bundle_dir
            .clone()
            .unwrap_or_else(|| self.install_dir().join(BUNDLE_DIR_NAME))
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}
