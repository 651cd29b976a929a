//! Shared test harness: a ChatService over a temp data root, an
//! in-process echo sandbox runner, and LLM doubles.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use wl_domain::config::RuntimeConfig;
use wl_domain::tool::Role;
use wl_domain::Result;
use wl_providers::{GenerateRequest, LlmClient, LlmResponse, ProviderRegistry};
use wl_runtime::ChatService;
use wl_sandbox::{ExecutionResult, SandboxArtifact, SandboxRunner};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo sandbox runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records executed scripts and echoes them back. A `make_artifact:`
/// marker in the code drops a file into the workspace artifacts tree.
pub struct EchoRunner {
    data_dir: std::path::PathBuf,
    pub executions: Mutex<Vec<(String, String)>>,
}

impl EchoRunner {
    pub fn new(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn codes_for(&self, worldline_id: &str) -> Vec<String> {
        self.executions
            .lock()
            .iter()
            .filter(|(wid, _)| wid == worldline_id)
            .map(|(_, code)| code.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl SandboxRunner for EchoRunner {
    async fn start(&self, _worldline_id: &str) -> Result<String> {
        Ok(wl_domain::id::new_id("sandbox"))
    }

    async fn execute(
        &self,
        _sandbox_id: &str,
        worldline_id: &str,
        code: &str,
        _timeout_s: u64,
    ) -> Result<ExecutionResult> {
        self.executions
            .lock()
            .push((worldline_id.to_string(), code.to_string()));

        let mut artifacts = Vec::new();
        if let Some(marker) = code.lines().find_map(|l| l.strip_prefix("# make_artifact:")) {
            let name = marker.trim();
            let dir = self
                .data_dir
                .join("worldlines")
                .join(worldline_id)
                .join("workspace")
                .join("artifacts");
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(name);
            std::fs::write(&path, b"artifact-bytes")?;
            artifacts.push(SandboxArtifact {
                artifact_type: "image".into(),
                name: name.to_string(),
                path: path.to_string_lossy().into_owned(),
            });
        }

        Ok(ExecutionResult {
            stdout: format!("ran {} bytes", code.len()),
            stderr: String::new(),
            error: None,
            artifacts,
        })
    }

    async fn stop(&self, _sandbox_id: &str) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keyed LLM double
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum Step {
    Respond(LlmResponse),
    Fail(String),
    DelayThen(Duration, LlmResponse),
}

/// Routes each request by substring match on the last user message, so
/// concurrent subagent children get deterministic, independent scripts.
pub struct KeyedClient {
    routes: Mutex<Vec<(String, VecDeque<Step>)>>,
    pub requests: Mutex<Vec<GenerateRequest>>,
}

impl KeyedClient {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn route(self, key: &str, steps: Vec<Step>) -> Self {
        self.routes.lock().push((key.to_string(), steps.into()));
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl LlmClient for KeyedClient {
    async fn generate(&self, req: GenerateRequest) -> Result<LlmResponse> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests.lock().push(req);

        let step = {
            let mut routes = self.routes.lock();
            routes
                .iter_mut()
                .find(|(key, steps)| last_user.contains(key.as_str()) && !steps.is_empty())
                .and_then(|(_, steps)| steps.pop_front())
        };

        match step {
            None => Ok(LlmResponse::text_only("Done.")),
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(message)) => Err(wl_domain::Error::llm(message)),
            Some(Step::DelayThen(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
        }
    }

    fn provider_id(&self) -> &str {
        "keyed"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Harness {
    pub _tmp: TempDir,
    pub service: Arc<ChatService>,
    pub runner: Arc<EchoRunner>,
    pub thread_id: String,
    pub worldline_id: String,
}

pub fn harness(client: Arc<dyn LlmClient>) -> Harness {
    harness_with(client, |_| {})
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn harness_with(client: Arc<dyn LlmClient>, tweak: impl FnOnce(&mut RuntimeConfig)) -> Harness {
    init_tracing();
    let tmp = TempDir::new().expect("tempdir");
    let mut config = RuntimeConfig {
        data_dir: tmp.path().to_path_buf(),
        ..RuntimeConfig::default()
    };
    tweak(&mut config);

    let providers = Arc::new(ProviderRegistry::new());
    providers.register("test", client);

    let runner = Arc::new(EchoRunner::new(config.data_dir.clone()));
    let service = ChatService::new(config, providers, runner.clone()).expect("service");

    let thread_id = service.store().create_thread(Some("test")).expect("thread").id;
    let worldline_id = service
        .store()
        .create_worldline(&thread_id, Some("main"))
        .expect("worldline")
        .id;

    Harness {
        _tmp: tmp,
        service,
        runner,
        thread_id,
        worldline_id,
    }
}
