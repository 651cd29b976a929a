//! The runner contract and its result types.

use std::path::Path;

use serde::{Deserialize, Serialize};
use wl_domain::Result;

/// A file found in the workspace `artifacts/` tree after an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    pub path: String,
}

/// Outcome of one sandbox execution. `error` is `None` on success; the
/// manager inspects it for fatal indicators that force a rebuild.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub artifacts: Vec<SandboxArtifact>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Opaque execution-environment boundary. The runtime never sees
/// container flags, only this contract.
#[async_trait::async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Provision an environment for the worldline and return its id.
    async fn start(&self, worldline_id: &str) -> Result<String>;

    /// Run one script inside the environment.
    async fn execute(
        &self,
        sandbox_id: &str,
        worldline_id: &str,
        code: &str,
        timeout_s: u64,
    ) -> Result<ExecutionResult>;

    /// Tear the environment down. Best effort.
    async fn stop(&self, sandbox_id: &str) -> Result<()>;
}

fn artifact_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp") => "image",
        Some("csv") => "csv",
        Some("md") => "md",
        Some("pdf") => "pdf",
        _ => "file",
    }
}

/// Scan `workspace/artifacts` recursively for produced files, in sorted
/// path order.
pub fn scan_artifacts(workspace: &Path) -> Vec<SandboxArtifact> {
    let artifacts_dir = workspace.join("artifacts");
    let mut paths = Vec::new();
    collect_files(&artifacts_dir, &mut paths);
    paths.sort();

    paths
        .into_iter()
        .map(|path| SandboxArtifact {
            artifact_type: artifact_type_for(&path).to_string(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_string_lossy().into_owned(),
        })
        .collect()
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if path.is_file() {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scan_classifies_by_extension() {
        let tmp = TempDir::new().unwrap();
        let artifacts = tmp.path().join("artifacts");
        std::fs::create_dir_all(artifacts.join("nested")).unwrap();
        std::fs::write(artifacts.join("plot.PNG"), b"x").unwrap();
        std::fs::write(artifacts.join("data.csv"), b"x").unwrap();
        std::fs::write(artifacts.join("nested/notes.md"), b"x").unwrap();
        std::fs::write(artifacts.join("blob.bin"), b"x").unwrap();

        let found = scan_artifacts(tmp.path());
        assert_eq!(found.len(), 4);
        let types: Vec<(&str, &str)> = found
            .iter()
            .map(|a| (a.name.as_str(), a.artifact_type.as_str()))
            .collect();
        assert!(types.contains(&("plot.PNG", "image")));
        assert!(types.contains(&("data.csv", "csv")));
        assert!(types.contains(&("notes.md", "md")));
        assert!(types.contains(&("blob.bin", "file")));
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_artifacts(tmp.path()).is_empty());
    }
}
