//! Docker-CLI-backed runner: each execution is a one-shot locked-down
//! `docker run` against the worldline's workspace mount. Stickiness is
//! provided by the manager; the runner itself is stateless between
//! executions.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use wl_domain::id::new_id;
use wl_domain::{Error, Result};

use crate::runner::{scan_artifacts, ExecutionResult, SandboxRunner};

const DEFAULT_IMAGE: &str = "python:3.11-slim";
const PIDS_LIMIT: u32 = 128;
const MEMORY_LIMIT: &str = "512m";
const CPU_LIMIT: &str = "1.0";

pub struct DockerSandboxRunner {
    image: String,
    data_dir: PathBuf,
}

impl DockerSandboxRunner {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            data_dir: data_dir.into(),
        }
    }

    pub fn with_image(data_dir: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            data_dir: data_dir.into(),
        }
    }

    fn workspace_dir(&self, worldline_id: &str) -> PathBuf {
        self.data_dir
            .join("worldlines")
            .join(worldline_id)
            .join("workspace")
    }

    fn build_command(&self, workspace: &Path) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .args(["--network", "none"])
            .args(["--cap-drop", "ALL"])
            .args(["--security-opt", "no-new-privileges"])
            .arg("--read-only")
            .arg("--pids-limit")
            .arg(PIDS_LIMIT.to_string())
            .args(["--memory", MEMORY_LIMIT])
            .args(["--cpus", CPU_LIMIT])
            .args(["--user", "1000:1000"])
            .args(["--tmpfs", "/tmp:rw,nosuid,nodev,size=64m"])
            .args(["-e", "MPLBACKEND=Agg"])
            .args(["-e", "PYTHONDONTWRITEBYTECODE=1"])
            .arg("-v")
            .arg(format!("{}:/workspace", workspace.display()))
            .args(["-w", "/workspace"])
            .arg(&self.image)
            .args(["python", "/workspace/.runner_input.py"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl SandboxRunner for DockerSandboxRunner {
    async fn start(&self, worldline_id: &str) -> Result<String> {
        let workspace = self.workspace_dir(worldline_id);
        tokio::fs::create_dir_all(workspace.join("artifacts")).await?;
        Ok(new_id("sandbox"))
    }

    async fn execute(
        &self,
        sandbox_id: &str,
        worldline_id: &str,
        code: &str,
        timeout_s: u64,
    ) -> Result<ExecutionResult> {
        let workspace = self.workspace_dir(worldline_id);
        tokio::fs::create_dir_all(workspace.join("artifacts")).await?;

        let script_path = workspace.join(".runner_input.py");
        tokio::fs::write(&script_path, code).await?;

        let mut cmd = self.build_command(&workspace);
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let _ = tokio::fs::remove_file(&script_path).await;
                return Ok(ExecutionResult {
                    error: Some("docker CLI not found on PATH".into()),
                    artifacts: scan_artifacts(&workspace),
                    ..ExecutionResult::default()
                });
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&script_path).await;
                return Err(Error::sandbox(format!("failed to spawn docker: {err}")));
            }
        };

        let outcome = tokio::time::timeout(Duration::from_secs(timeout_s), child.wait_with_output()).await;
        let _ = tokio::fs::remove_file(&script_path).await;

        let result = match outcome {
            Err(_) => {
                tracing::warn!(sandbox_id, worldline_id, timeout_s, "sandbox execution timed out");
                ExecutionResult {
                    error: Some(format!("Python execution timed out after {timeout_s} seconds")),
                    artifacts: scan_artifacts(&workspace),
                    ..ExecutionResult::default()
                }
            }
            Ok(Err(err)) => ExecutionResult {
                error: Some(err.to_string()),
                artifacts: scan_artifacts(&workspace),
                ..ExecutionResult::default()
            },
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let error = if output.status.success() {
                    None
                } else {
                    let trimmed = stderr.trim();
                    Some(if trimmed.is_empty() {
                        format!("Process exited with code {}", output.status.code().unwrap_or(-1))
                    } else {
                        trimmed.to_string()
                    })
                };
                ExecutionResult {
                    stdout,
                    stderr,
                    error,
                    artifacts: scan_artifacts(&workspace),
                }
            }
        };

        Ok(result)
    }

    async fn stop(&self, _sandbox_id: &str) -> Result<()> {
        // One-shot `docker run --rm` leaves nothing to tear down.
        Ok(())
    }
}
