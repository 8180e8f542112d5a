//! Aggregated health report for the whole backend setup.
//!
//! Every section is best-effort: a failure in one probe is recorded in the
//! report and never aborts the rest.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, RunnerChannel, RunnerMode};
use crate::context::BackendContext;
use crate::environment::EnvironmentDiagnostics;
use crate::runner::RunnerDiagnostics;

const MANIFEST_FILE: &str = "manifest.json";
const LOGS_DIR: &str = "logs";
const RECENT_LOG_COUNT: usize = 3;
const LOG_TAIL_LINES: usize = 50;

/// Echo of the effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationSummary {
    pub source_path: Option<PathBuf>,
    pub kb_workspace_path: Option<PathBuf>,
    pub python_path: Option<PathBuf>,
    pub backend_mode: RunnerMode,
    pub backend_channel: RunnerChannel,
    pub storage_root: PathBuf,
    pub install_dir: PathBuf,
}

impl From<&Config> for ConfigurationSummary {
    fn from(config: &Config) -> Self {
        Self {
            source_path: config.source_path.clone(),
            kb_workspace_path: config.kb_workspace_path.clone(),
            python_path: config.python_path.clone(),
            backend_mode: config.backend_mode,
            backend_channel: config.backend_channel,
            storage_root: config.storage_root(),
            install_dir: config.install_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExeStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenvStatus {
    pub python_path: PathBuf,
    pub python_exists: bool,
    pub backend_path: PathBuf,
    pub backend_exists: bool,
    pub backend_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub mode: RunnerMode,
    pub channel: RunnerChannel,
    pub exe: ExeStatus,
    pub venv: VenvStatus,
    /// Name of the selected runner, if selection succeeded.
    pub current_runner: Option<String>,
    pub healthy: Option<bool>,
    pub diagnostics: Option<RunnerDiagnostics>,
    pub selection_error: Option<String>,
}

/// Fields of the backend's `manifest.json` surfaced in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSummary {
    #[serde(default = "never")]
    pub last_crawl: String,
    #[serde(default = "never")]
    pub last_ingest: String,
    #[serde(default)]
    pub document_count: u64,
    #[serde(default)]
    pub total_chunks: u64,
}

fn never() -> String {
    "never".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseStatus {
    pub workspace: PathBuf,
    pub workspace_exists: bool,
    pub manifest_exists: bool,
    pub manifest: Option<ManifestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStatus {
    pub logs_directory: PathBuf,
    /// Newest first, by file name.
    pub recent_log_files: Vec<String>,
    pub latest_log_tail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub timestamp: String,
    pub configuration: ConfigurationSummary,
    pub environment: EnvironmentDiagnostics,
    pub backend: BackendStatus,
    pub knowledge_base: KnowledgeBaseStatus,
    pub logs: Option<LogStatus>,
    pub issues: Vec<String>,
}

impl DoctorReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Run every check and assemble the report.
pub async fn run_doctor(ctx: &BackendContext) -> DoctorReport {
    let config = ctx.config();
    let manager = ctx.manager();

    let environment = manager.diagnostics(config.python_path.as_deref()).await;
    let backend = backend_status(ctx).await;

    let workspace = ctx.workspace_for(None, None);
    let knowledge_base = knowledge_base_status(&workspace);
    let logs = log_status(&workspace.join(LOGS_DIR));

    let issues = collect_issues(config, &environment, &backend);
    if issues.is_empty() {
        info!("All checks passed");
    } else {
        for issue in &issues {
            warn!(issue = %issue, "Doctor found an issue");
        }
    }

    DoctorReport {
        timestamp: Utc::now().to_rfc3339(),
        configuration: ConfigurationSummary::from(config),
        environment,
        backend,
        knowledge_base,
        logs,
        issues,
    }
}

async fn backend_status(ctx: &BackendContext) -> BackendStatus {
    let selector = ctx.selector();
    let exe_path = selector.packaged().exe_path().to_path_buf();
    let exe_size = fs::metadata(&exe_path).ok().map(|m| m.len());

    let paths = ctx.manager().paths();
    let venv = VenvStatus {
        python_exists: paths.env_python.exists(),
        python_path: paths.env_python.clone(),
        backend_exists: paths.entry_point().exists(),
        backend_path: paths.backend_root.clone(),
        backend_version: ctx.manager().version().to_string(),
    };

    let mut status = BackendStatus {
        mode: selector.mode(),
        channel: selector.channel(),
        exe: ExeStatus {
            path: exe_path,
            exists: exe_size.is_some(),
            size: exe_size.unwrap_or(0),
        },
        venv,
        current_runner: None,
        healthy: None,
        diagnostics: None,
        selection_error: None,
    };

    match ctx.runner().await {
        Ok(runner) => {
            status.current_runner = Some(runner.kind().name().to_string());
            status.healthy = Some(runner.health_check().await);
            status.diagnostics = Some(runner.diagnostics().await);
        }
        Err(e) => status.selection_error = Some(e.to_string()),
    }

    status
}

fn knowledge_base_status(workspace: &Path) -> KnowledgeBaseStatus {
    let manifest_path = workspace.join(MANIFEST_FILE);
    let mut status = KnowledgeBaseStatus {
        workspace: workspace.to_path_buf(),
        workspace_exists: workspace.exists(),
        manifest_exists: manifest_path.exists(),
        manifest: None,
        manifest_error: None,
    };

    if status.manifest_exists {
        match read_manifest(&manifest_path) {
            Ok(summary) => status.manifest = Some(summary),
            Err(e) => status.manifest_error = Some(format!("Error reading manifest: {e}")),
        }
    }
    status
}

fn read_manifest(path: &Path) -> anyhow::Result<ManifestSummary> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn log_status(logs_dir: &Path) -> Option<LogStatus> {
    let entries = fs::read_dir(logs_dir).ok()?;

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".log"))
        .collect();
    names.sort_unstable_by(|a, b| b.cmp(a));
    names.truncate(RECENT_LOG_COUNT);

    let latest_log_tail = names
        .first()
        .and_then(|name| fs::read_to_string(logs_dir.join(name)).ok())
        .map(|contents| tail_lines(&contents, LOG_TAIL_LINES));

    Some(LogStatus {
        logs_directory: logs_dir.to_path_buf(),
        recent_log_files: names,
        latest_log_tail,
    })
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

fn collect_issues(
    config: &Config,
    environment: &EnvironmentDiagnostics,
    backend: &BackendStatus,
) -> Vec<String> {
    let has_exe = backend.exe.exists;
    let has_venv = environment.env_exists && environment.health_check;
    let mut issues = Vec::new();

    if !has_exe && !has_venv {
        issues.push("No backend available (neither packaged executable nor managed environment)".to_string());
    }
    if config.backend_mode == RunnerMode::Exe && !has_exe {
        issues.push("Backend mode set to exe but the packaged executable was not found".to_string());
    }
    if config.backend_mode == RunnerMode::Venv && !has_venv {
        issues.push("Backend mode set to venv but the managed environment is not ready".to_string());
    }
    if environment.interpreter_detected.is_none() && !has_exe {
        issues.push("Python not detected and no packaged executable available".to_string());
    }
    if config.source_path.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
        issues.push("Source path not configured".to_string());
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_missing_fields() {
        let summary: ManifestSummary =
            serde_json::from_str(r#"{"document_count": 12, "extra": true}"#).unwrap();
        assert_eq!(summary.last_crawl, "never");
        assert_eq!(summary.last_ingest, "never");
        assert_eq!(summary.document_count, 12);
        assert_eq!(summary.total_chunks, 0);
    }

    #[test]
    fn knowledge_base_reports_bad_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "{ nope").unwrap();

        let status = knowledge_base_status(dir.path());
        assert!(status.workspace_exists);
        assert!(status.manifest_exists);
        assert!(status.manifest.is_none());
        assert!(status
            .manifest_error
            .unwrap()
            .starts_with("Error reading manifest"));
    }

    #[test]
    fn logs_newest_first_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["2026-01-01.log", "2026-01-03.log", "2026-01-02.log", "2025-12-31.log"] {
            fs::write(dir.path().join(name), "old\n").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let body: String = (1..=60).map(|i| format!("line {i}\n")).collect();
        fs::write(dir.path().join("2026-01-03.log"), body).unwrap();

        let status = log_status(dir.path()).unwrap();
        assert_eq!(
            status.recent_log_files,
            vec!["2026-01-03.log", "2026-01-02.log", "2026-01-01.log"]
        );
        let tail = status.latest_log_tail.unwrap();
        assert_eq!(tail.lines().count(), LOG_TAIL_LINES);
        assert!(tail.starts_with("line 11"));
        assert!(tail.ends_with("line 60"));
    }

    #[test]
    fn missing_logs_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(log_status(&dir.path().join(LOGS_DIR)).is_none());
    }

    #[tokio::test]
    async fn empty_installation_reports_issues() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_root: Some(dir.path().join("storage")),
            install_dir: Some(dir.path().join("install")),
            backend_mode: RunnerMode::Exe,
            ..Config::default()
        };
        let ctx = BackendContext::new(config);

        let report = run_doctor(&ctx).await;
        assert!(!report.is_ok());
        assert!(!report.backend.exe.exists);
        assert!(report.backend.current_runner.is_none());
        assert!(report.backend.selection_error.is_some());
        assert!(report
            .issues
            .iter()
            .any(|i| i.starts_with("No backend available")));
        assert!(report
            .issues
            .iter()
            .any(|i| i.starts_with("Backend mode set to exe")));
        assert!(report
            .issues
            .iter()
            .any(|i| i == "Source path not configured"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["configuration"]["backend_mode"], "exe");
        assert!(json["knowledge_base"]["manifest"].is_null());
    }
}
