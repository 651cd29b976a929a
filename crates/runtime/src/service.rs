//! The chat service facade: the inbound contracts (`run`, `stream`,
//! jobs, direct tools, runtime snapshot) presented to whatever
//! transport sits in front of the core. HTTP/SSE framing lives outside
//! this workspace; durability and ordering live here.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use wl_domain::config::RuntimeConfig;
use wl_domain::job::{ChatTurnJob, JobLineage, JobStatus, TurnRequest};
use wl_domain::turn::TurnOutcome;
use wl_domain::Result;
use wl_providers::ProviderRegistry;
use wl_sandbox::{spawn_reaper, SandboxManager, SandboxRunner};
use wl_store::MetaStore;

use crate::capacity::CapacityController;
use crate::coordinator::TurnCoordinator;
use crate::dispatcher::ToolDispatcher;
use crate::engine::TurnEngine;
use crate::python_tool::{execute_python_tool, PythonToolRequest};
use crate::scheduler::{ChatJobScheduler, TurnRunner};
use crate::signals::{TurnSignal, TurnSignals};
use crate::sql_tool::{execute_sql_tool, SqlToolRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine-backed turn runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds a fresh engine per turn, resolving the provider from the
/// request (falling back to the configured default).
struct EngineTurnRunner {
    store: Arc<MetaStore>,
    sandboxes: Arc<SandboxManager>,
    capacity: Arc<CapacityController>,
    coordinator: TurnCoordinator,
    providers: Arc<ProviderRegistry>,
    default_provider: Option<String>,
}

impl EngineTurnRunner {
    fn engine_for(&self, request: &TurnRequest) -> Result<TurnEngine> {
        let provider = request
            .provider
            .as_deref()
            .or(self.default_provider.as_deref());
        let client = self.providers.resolve(provider)?;
        let dispatcher = ToolDispatcher::new(
            self.store.clone(),
            self.sandboxes.clone(),
            self.capacity.clone(),
            self.coordinator.clone(),
            client.clone(),
        );
        Ok(TurnEngine::new(
            self.store.clone(),
            client,
            dispatcher,
            request.clamped_max_iterations(),
        )
        .with_model(request.model.clone()))
    }
}

#[async_trait::async_trait]
impl TurnRunner for EngineTurnRunner {
    async fn run_turn(
        &self,
        worldline_id: &str,
        request: &TurnRequest,
        signals: &TurnSignals,
    ) -> Result<TurnOutcome> {
        let engine = self.engine_for(request)?;
        engine.run_turn(worldline_id, &request.message, signals).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChatService {
    config: RuntimeConfig,
    store: Arc<MetaStore>,
    capacity: Arc<CapacityController>,
    coordinator: TurnCoordinator,
    sandboxes: Arc<SandboxManager>,
    scheduler: ChatJobScheduler,
    runner: Arc<EngineTurnRunner>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChatService {
    pub fn new(
        config: RuntimeConfig,
        providers: Arc<ProviderRegistry>,
        sandbox_runner: Arc<dyn SandboxRunner>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(MetaStore::open(&config.data_dir)?);
        let capacity = Arc::new(CapacityController::new(&config));
        let coordinator = TurnCoordinator::new();
        let sandboxes = Arc::new(SandboxManager::new(
            sandbox_runner,
            config.sandbox_max_concurrency,
            config.sandbox_max_queue,
        ));

        let runner = Arc::new(EngineTurnRunner {
            store: store.clone(),
            sandboxes: sandboxes.clone(),
            capacity: capacity.clone(),
            coordinator: coordinator.clone(),
            providers,
            default_provider: config.llm_provider.clone(),
        });
        let scheduler = ChatJobScheduler::new(
            store.clone(),
            coordinator.clone(),
            capacity.clone(),
            runner.clone(),
        );

        Ok(Arc::new(Self {
            config,
            store,
            capacity,
            coordinator,
            sandboxes,
            scheduler,
            runner,
            reaper: Mutex::new(None),
        }))
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    pub fn capacity(&self) -> &Arc<CapacityController> {
        &self.capacity
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Start background machinery: job recovery plus the sandbox reaper.
    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(spawn_reaper(
                self.sandboxes.clone(),
                std::time::Duration::from_secs(self.config.sandbox_reaper_interval_secs),
                std::time::Duration::from_secs(self.config.sandbox_idle_ttl_secs),
            ));
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.coordinator.shutdown().await;
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.sandboxes.shutdown_all().await;
    }

    // ── chat.run / chat.stream ────────────────────────────────────────

    /// Execute one turn inline: serialized per worldline, under a turn
    /// lease.
    pub async fn run(
        &self,
        worldline_id: &str,
        request: TurnRequest,
    ) -> Result<TurnOutcome> {
        self.run_with_signals(worldline_id, request, TurnSignals::none())
            .await
    }

    /// Like [`run`](Self::run), but streaming persisted events and
    /// progress deltas over the given channel. The channel is advisory:
    /// a dropped receiver never cancels the turn.
    pub async fn run_streaming(
        &self,
        worldline_id: &str,
        request: TurnRequest,
        sender: mpsc::Sender<TurnSignal>,
    ) -> Result<TurnOutcome> {
        self.run_with_signals(worldline_id, request, TurnSignals::new(sender))
            .await
    }

    async fn run_with_signals(
        &self,
        worldline_id: &str,
        request: TurnRequest,
        signals: TurnSignals,
    ) -> Result<TurnOutcome> {
        self.store.worldline(worldline_id)?;

        let runner = self.runner.clone();
        let capacity = self.capacity.clone();
        let wid = worldline_id.to_string();
        self.coordinator
            .run(worldline_id, move || async move {
                let _lease = capacity.lease_turn().await?;
                runner.run_turn(&wid, &request, &signals).await
            })
            .await
    }

    // ── chat.jobs ─────────────────────────────────────────────────────

    /// Durable enqueue + immediate scheduling. Returns the job record
    /// including its queue position.
    pub async fn enqueue_job(
        &self,
        worldline_id: &str,
        request: TurnRequest,
        lineage: JobLineage,
    ) -> Result<ChatTurnJob> {
        let worldline = self.store.worldline(worldline_id)?;
        let job = self
            .scheduler
            .enqueue(&worldline.thread_id, worldline_id, &request, &lineage)?;
        self.scheduler.schedule(&job.id).await?;
        Ok(job)
    }

    pub fn job(&self, job_id: &str) -> Result<ChatTurnJob> {
        self.store.job(job_id)
    }

    pub fn list_jobs(
        &self,
        worldline_id: Option<&str>,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<ChatTurnJob>> {
        self.store.list_jobs(worldline_id, statuses, limit)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.store.cancel_job(job_id)
    }

    // ── tools.sql / tools.python ──────────────────────────────────────

    /// Direct SQL tool surface (`limit` clamped to `1..=100_000`).
    pub async fn execute_sql(&self, mut request: SqlToolRequest) -> Result<serde_json::Value> {
        request.limit = request.limit.clamp(1, 100_000);
        execute_sql_tool(&self.store, &request, &TurnSignals::none()).await
    }

    /// Direct Python tool surface (`timeout` clamped to `1..=600`).
    pub async fn execute_python(&self, mut request: PythonToolRequest) -> Result<serde_json::Value> {
        request.timeout = request.timeout.clamp(1, 600);
        execute_python_tool(
            &self.store,
            &self.sandboxes,
            &self.capacity,
            &request,
            &TurnSignals::none(),
        )
        .await
    }

    // ── External databases ────────────────────────────────────────────

    /// Register an external DB for read-only attachment on the
    /// worldline's queries and record the attachment on the timeline.
    pub fn attach_external_db(
        &self,
        worldline_id: &str,
        alias: &str,
        db_path: &str,
    ) -> Result<wl_domain::event::EventRecord> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(wl_domain::Error::bad_request("alias must not be empty"));
        }
        self.store.worldline(worldline_id)?;
        self.store.datadb().register_external(worldline_id, alias, db_path)?;
        self.store.append_event(
            worldline_id,
            wl_domain::event::EventType::ExternalDbAttached,
            &serde_json::json!({"alias": alias, "db_path": db_path}),
        )
    }

    /// Remove an external registration and record the detachment.
    pub fn detach_external_db(
        &self,
        worldline_id: &str,
        alias: &str,
    ) -> Result<wl_domain::event::EventRecord> {
        self.store.worldline(worldline_id)?;
        if !self.store.datadb().remove_external(worldline_id, alias)? {
            return Err(wl_domain::Error::not_found(format!(
                "external source '{alias}' on worldline {worldline_id}"
            )));
        }
        self.store.append_event(
            worldline_id,
            wl_domain::event::EventType::ExternalDbDetached,
            &serde_json::json!({"alias": alias}),
        )
    }

    // ── Observability ─────────────────────────────────────────────────

    pub fn runtime_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "capacity": self.capacity.snapshot(),
            "sandboxes": self.sandboxes.pool_status(),
        })
    }
}
