//! Persisted workspace resolution.
//!
//! The backend keeps its index, manifest and logs in a workspace directory.
//! Resolution order: explicit override (if it exists on disk), then
//! `<source>/.kts`, then `<configured source>/.kts`, then a global fallback.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Directory created under a source folder to hold its workspace.
pub const WORKSPACE_DIR_NAME: &str = ".kts";

/// Variable telling the backend where its workspace lives.
pub const KB_PATH_VAR: &str = "KTS_KB_PATH";

/// Variable telling the backend which source folder it is working on.
pub const SOURCE_PATH_VAR: &str = "KTS_SOURCE_PATH";

fn present(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Resolve the workspace directory without touching the filesystem beyond
/// the existence check on the override.
pub fn resolve_workspace(
    explicit_override: Option<&Path>,
    source_path: Option<&Path>,
    configured_source_path: Option<&Path>,
    global_fallback: &Path,
) -> PathBuf {
    if let Some(path) = present(explicit_override).filter(|p| p.exists()) {
        return path.to_path_buf();
    }
    if let Some(source) = present(source_path) {
        return source.join(WORKSPACE_DIR_NAME);
    }
    if let Some(source) = present(configured_source_path) {
        return source.join(WORKSPACE_DIR_NAME);
    }
    global_fallback.to_path_buf()
}

/// Resolve the workspace and make sure the directory exists.
pub fn prepare_workspace(
    explicit_override: Option<&Path>,
    source_path: Option<&Path>,
    configured_source_path: Option<&Path>,
    global_fallback: &Path,
) -> io::Result<PathBuf> {
    let workspace = resolve_workspace(
        explicit_override,
        source_path,
        configured_source_path,
        global_fallback,
    );
    fs::create_dir_all(&workspace)?;
    debug!(workspace = %workspace.display(), "Workspace ready");
    Ok(workspace)
}

/// Environment overlay exposing the workspace (and source, when known).
pub fn backend_env(workspace: &Path, source_path: Option<&Path>) -> HashMap<String, String> {
    let mut env = HashMap::from([(
        KB_PATH_VAR.to_string(),
        workspace.to_string_lossy().into_owned(),
    )]);
    if let Some(source) = present(source_path) {
        env.insert(
            SOURCE_PATH_VAR.to_string(),
            source.to_string_lossy().into_owned(),
        );
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let kb = dir.path().join("kb");
        fs::create_dir_all(&kb).unwrap();

        let resolved = prepare_workspace(
            Some(&kb),
            Some(Path::new("/data/docs")),
            Some(Path::new("/configured")),
            &dir.path().join("fallback"),
        )
        .unwrap();
        assert_eq!(resolved, kb);
    }

    #[test]
    fn missing_override_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("docs");

        let resolved = prepare_workspace(
            Some(&dir.path().join("does-not-exist")),
            Some(&source),
            None,
            &dir.path().join("fallback"),
        )
        .unwrap();
        assert_eq!(resolved, source.join(".kts"));
        assert!(resolved.is_dir());
    }

    #[test]
    fn source_path_derives_workspace() {
        assert_eq!(
            resolve_workspace(
                None,
                Some(Path::new("/data/docs")),
                Some(Path::new("/configured")),
                Path::new("/global")
            ),
            PathBuf::from("/data/docs/.kts")
        );
    }

    #[test]
    fn configured_source_used_next() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("configured");

        let resolved = prepare_workspace(
            None,
            Some(Path::new("")),
            Some(&configured),
            &dir.path().join("fallback"),
        )
        .unwrap();
        assert_eq!(resolved, configured.join(".kts"));
        assert!(resolved.is_dir());
    }

    #[test]
    fn global_fallback_last() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("workspace").join("default");

        let resolved = prepare_workspace(None, None, None, &fallback).unwrap();
        assert_eq!(resolved, fallback);
        assert!(fallback.is_dir());

        // Idempotent
        assert_eq!(prepare_workspace(None, None, None, &fallback).unwrap(), fallback);
    }

    #[test]
    fn env_overlay_includes_source_when_known() {
        let env = backend_env(Path::new("/kb"), Some(Path::new("/docs")));
        assert_eq!(env[KB_PATH_VAR], "/kb");
        assert_eq!(env[SOURCE_PATH_VAR], "/docs");

        let env = backend_env(Path::new("/kb"), None);
        assert_eq!(env.len(), 1);
        assert!(!env.contains_key(SOURCE_PATH_VAR));
    }
}
