//! Sticky-per-worldline sandbox pool.
//!
//! One handle per active worldline; the pool semaphore counts distinct
//! sandboxes, not requests. A handle owns its pool permit, so removal
//! (invalidate / reap / shutdown) releases the slot when the last clone
//! drops. Concurrent first callers for a worldline share one creation
//! future; only the installer cleans up the in-progress entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
// tokio's Instant so paused-clock tests can age handles.
use tokio::time::Instant;
use wl_domain::{Error, Result};

use crate::runner::{ExecutionResult, SandboxRunner};

/// Error messages that indicate a poisoned environment; the handle is
/// dropped so the next call rebuilds a clean one.
const FATAL_INDICATORS: &[&str] = &[
    "timed out", "timeout", "container", "docker", "resource", "memory", "killed", "signal",
];

pub struct SandboxHandle {
    pub(crate) worldline_id: String,
    pub(crate) sandbox_id: String,
    /// One command per sandbox at a time.
    pub(crate) exec_lock: tokio::sync::Mutex<()>,
    pub(crate) last_used: Mutex<Instant>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone, Debug)]
enum CreateFailure {
    Capacity(String),
    Failed(String),
}

type CreationFuture = Shared<BoxFuture<'static, std::result::Result<Arc<SandboxHandle>, CreateFailure>>>;

#[derive(Default)]
struct ManagerState {
    handles: HashMap<String, Arc<SandboxHandle>>,
    creating: HashMap<String, CreationFuture>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxPoolStatus {
    pub active: usize,
    pub max: usize,
    pub available: usize,
    pub queued: usize,
    pub max_queue: usize,
}

pub struct SandboxManager {
    runner: Arc<dyn SandboxRunner>,
    state: Mutex<ManagerState>,
    semaphore: Arc<Semaphore>,
    queued: Arc<Mutex<usize>>,
    max_sandboxes: usize,
    max_queue: usize,
}

impl SandboxManager {
    pub fn new(runner: Arc<dyn SandboxRunner>, max_sandboxes: usize, max_queue: usize) -> Self {
        let max_sandboxes = max_sandboxes.max(1);
        Self {
            runner,
            state: Mutex::new(ManagerState::default()),
            semaphore: Arc::new(Semaphore::new(max_sandboxes)),
            queued: Arc::new(Mutex::new(0)),
            max_sandboxes,
            max_queue,
        }
    }

    // ── Acquisition ───────────────────────────────────────────────────

    async fn get_or_create(&self, worldline_id: &str) -> Result<Arc<SandboxHandle>> {
        let (future, creator) = {
            let mut state = self.state.lock();
            if let Some(handle) = state.handles.get(worldline_id) {
                return Ok(handle.clone());
            }
            match state.creating.get(worldline_id) {
                Some(in_progress) => (in_progress.clone(), false),
                None => {
                    let future = Self::creation_future(
                        self.runner.clone(),
                        self.semaphore.clone(),
                        self.queued.clone(),
                        self.max_queue,
                        worldline_id.to_string(),
                    )
                    .boxed()
                    .shared();
                    state.creating.insert(worldline_id.to_string(), future.clone());
                    (future, true)
                }
            }
        };

        let outcome = future.await;

        if creator {
            let mut state = self.state.lock();
            state.creating.remove(worldline_id);
            if let Ok(handle) = &outcome {
                state.handles.insert(worldline_id.to_string(), handle.clone());
                tracing::info!(
                    worldline_id,
                    sandbox_id = %handle.sandbox_id,
                    active = state.handles.len(),
                    max = self.max_sandboxes,
                    "created sandbox"
                );
            }
        }

        match outcome {
            Ok(handle) => Ok(handle),
            Err(CreateFailure::Capacity(msg)) => Err(Error::SandboxCapacity(msg)),
            Err(CreateFailure::Failed(msg)) => Err(Error::Sandbox(msg)),
        }
    }

    async fn creation_future(
        runner: Arc<dyn SandboxRunner>,
        semaphore: Arc<Semaphore>,
        queued: Arc<Mutex<usize>>,
        max_queue: usize,
        worldline_id: String,
    ) -> std::result::Result<Arc<SandboxHandle>, CreateFailure> {
        {
            let mut count = queued.lock();
            if *count >= max_queue {
                return Err(CreateFailure::Capacity(format!(
                    "sandbox queue full ({max_queue} waiting), try again later"
                )));
            }
            *count += 1;
        }

        let acquired = semaphore.acquire_owned().await;
        {
            let mut count = queued.lock();
            *count = count.saturating_sub(1);
        }
        let permit = acquired.map_err(|_| CreateFailure::Failed("sandbox pool closed".into()))?;

        match runner.start(&worldline_id).await {
            Ok(sandbox_id) => Ok(Arc::new(SandboxHandle {
                worldline_id,
                sandbox_id,
                exec_lock: tokio::sync::Mutex::new(()),
                last_used: Mutex::new(Instant::now()),
                _permit: permit,
            })),
            // Dropping the permit here releases the slot.
            Err(err) => Err(CreateFailure::Failed(err.to_string())),
        }
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Execute `code` in the worldline's sandbox, creating it on first
    /// use. Commands on one sandbox are serialized by the handle lock.
    pub async fn execute(
        &self,
        worldline_id: &str,
        code: &str,
        timeout_s: u64,
    ) -> Result<ExecutionResult> {
        let handle = self.get_or_create(worldline_id).await?;
        let _guard = handle.exec_lock.lock().await;
        let result = self
            .runner
            .execute(&handle.sandbox_id, worldline_id, code, timeout_s)
            .await?;
        *handle.last_used.lock() = Instant::now();

        if let Some(error) = &result.error {
            if should_invalidate(error) {
                tracing::warn!(
                    worldline_id,
                    sandbox_id = %handle.sandbox_id,
                    error = %error,
                    "invalidating sandbox after fatal error"
                );
                self.invalidate(worldline_id, &handle.sandbox_id).await;
            }
        }

        Ok(result)
    }

    /// Drop a poisoned handle and stop its environment so the next call
    /// rebuilds from scratch.
    async fn invalidate(&self, worldline_id: &str, sandbox_id: &str) {
        let removed = {
            let mut state = self.state.lock();
            match state.handles.get(worldline_id) {
                Some(handle) if handle.sandbox_id == sandbox_id => {
                    state.handles.remove(worldline_id).is_some()
                }
                _ => false,
            }
        };
        if removed {
            let _ = self.runner.stop(sandbox_id).await;
        }
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Evict handles idle for at least `ttl` whose exec lock is free.
    /// Returns the evicted worldline ids.
    pub async fn reap_idle(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut victims: Vec<Arc<SandboxHandle>> = Vec::new();
        {
            let mut state = self.state.lock();
            state.handles.retain(|_, handle| {
                let idle = now.duration_since(*handle.last_used.lock());
                if idle >= ttl {
                    // try_lock under the manager lock: a held lock means
                    // an execution is in flight, skip this round.
                    if let Ok(guard) = handle.exec_lock.try_lock() {
                        drop(guard);
                        victims.push(handle.clone());
                        return false;
                    }
                }
                true
            });
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for handle in victims {
            let _ = self.runner.stop(&handle.sandbox_id).await;
            tracing::info!(
                worldline_id = %handle.worldline_id,
                sandbox_id = %handle.sandbox_id,
                "reaped idle sandbox"
            );
            evicted.push(handle.worldline_id.clone());
        }
        evicted
    }

    /// Remove every handle, cancel in-flight creations, and stop each
    /// environment.
    pub async fn shutdown_all(&self) -> Vec<String> {
        let (handles, creating) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.handles),
                std::mem::take(&mut state.creating),
            )
        };
        drop(creating);

        let mut stopped = Vec::with_capacity(handles.len());
        for (worldline_id, handle) in handles {
            let _ = self.runner.stop(&handle.sandbox_id).await;
            stopped.push(worldline_id);
        }
        tracing::info!(count = stopped.len(), "shut down sandboxes");
        stopped
    }

    /// Worldlines with a live (warm) sandbox.
    pub fn active_worldlines(&self) -> Vec<String> {
        self.state.lock().handles.keys().cloned().collect()
    }

    pub fn is_warm(&self, worldline_id: &str) -> bool {
        self.state.lock().handles.contains_key(worldline_id)
    }

    pub fn pool_status(&self) -> SandboxPoolStatus {
        SandboxPoolStatus {
            active: self.state.lock().handles.len(),
            max: self.max_sandboxes,
            available: self.semaphore.available_permits(),
            queued: *self.queued.lock(),
            max_queue: self.max_queue,
        }
    }

    #[cfg(test)]
    pub(crate) fn age_handle(&self, worldline_id: &str, by: Duration) {
        let state = self.state.lock();
        if let Some(handle) = state.handles.get(worldline_id) {
            let mut last_used = handle.last_used.lock();
            *last_used = last_used.checked_sub(by).unwrap_or_else(Instant::now);
        }
    }
}

fn should_invalidate(error: &str) -> bool {
    let lowered = error.to_lowercase();
    FATAL_INDICATORS.iter().any(|ind| lowered.contains(ind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    struct StubRunner {
        starts: SyncMutex<Vec<String>>,
        stops: SyncMutex<Vec<String>>,
        /// Error string to embed in the next execution result.
        next_error: SyncMutex<Option<String>>,
    }

    impl StubRunner {
        fn new() -> Self {
            Self {
                starts: SyncMutex::new(Vec::new()),
                stops: SyncMutex::new(Vec::new()),
                next_error: SyncMutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl SandboxRunner for StubRunner {
        async fn start(&self, worldline_id: &str) -> Result<String> {
            let id = wl_domain::id::new_id("sandbox");
            self.starts.lock().push(worldline_id.to_string());
            Ok(id)
        }

        async fn execute(
            &self,
            _sandbox_id: &str,
            _worldline_id: &str,
            code: &str,
            _timeout_s: u64,
        ) -> Result<ExecutionResult> {
            Ok(ExecutionResult {
                stdout: format!("ran: {code}"),
                error: self.next_error.lock().take(),
                ..ExecutionResult::default()
            })
        }

        async fn stop(&self, sandbox_id: &str) -> Result<()> {
            self.stops.lock().push(sandbox_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn sandbox_is_sticky_per_worldline() {
        let runner = Arc::new(StubRunner::new());
        let manager = SandboxManager::new(runner.clone(), 3, 16);

        manager.execute("worldline_a", "1", 30).await.unwrap();
        manager.execute("worldline_a", "2", 30).await.unwrap();
        manager.execute("worldline_b", "3", 30).await.unwrap();

        assert_eq!(runner.starts.lock().len(), 2);
        assert!(manager.is_warm("worldline_a"));
        assert_eq!(manager.pool_status().active, 2);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_creation() {
        let runner = Arc::new(StubRunner::new());
        let manager = Arc::new(SandboxManager::new(runner.clone(), 3, 16));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.execute("worldline_a", &i.to_string(), 30).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(runner.starts.lock().len(), 1);
    }

    #[tokio::test]
    async fn queue_cap_fails_fast() {
        let runner = Arc::new(StubRunner::new());
        // One slot, zero queue: the first worldline takes the slot, a
        // second worldline must be rejected without waiting.
        let manager = SandboxManager::new(runner, 1, 0);
        manager.execute("worldline_a", "x", 30).await.unwrap();

        let err = manager.execute("worldline_b", "y", 30).await.unwrap_err();
        assert!(matches!(err, Error::SandboxCapacity(_)));
    }

    #[tokio::test]
    async fn fatal_error_invalidates_handle() {
        let runner = Arc::new(StubRunner::new());
        let manager = SandboxManager::new(runner.clone(), 3, 16);

        manager.execute("worldline_a", "x", 30).await.unwrap();
        *runner.next_error.lock() = Some("Python execution timed out after 30 seconds".into());
        let result = manager.execute("worldline_a", "y", 30).await.unwrap();
        assert!(result.error.is_some());

        assert!(!manager.is_warm("worldline_a"));
        assert_eq!(runner.stops.lock().len(), 1);

        // Next execution rebuilds a fresh sandbox.
        manager.execute("worldline_a", "z", 30).await.unwrap();
        assert_eq!(runner.starts.lock().len(), 2);
    }

    #[tokio::test]
    async fn benign_error_keeps_handle() {
        let runner = Arc::new(StubRunner::new());
        let manager = SandboxManager::new(runner.clone(), 3, 16);

        manager.execute("worldline_a", "x", 30).await.unwrap();
        *runner.next_error.lock() = Some("NameError: name 'df' is not defined".into());
        manager.execute("worldline_a", "y", 30).await.unwrap();

        assert!(manager.is_warm("worldline_a"));
        assert!(runner.stops.lock().is_empty());
    }

    #[tokio::test]
    async fn reaping_releases_the_pool_slot() {
        let runner = Arc::new(StubRunner::new());
        let manager = SandboxManager::new(runner.clone(), 1, 0);

        manager.execute("worldline_a", "x", 30).await.unwrap();
        assert_eq!(manager.pool_status().available, 0);

        // Not idle long enough: nothing reaped.
        assert!(manager.reap_idle(Duration::from_secs(900)).await.is_empty());

        manager.age_handle("worldline_a", Duration::from_secs(1000));
        let evicted = manager.reap_idle(Duration::from_secs(900)).await;
        assert_eq!(evicted, vec!["worldline_a".to_string()]);
        assert_eq!(runner.stops.lock().len(), 1);
        assert_eq!(manager.pool_status().available, 1);

        // The freed slot admits a different worldline, and a later call
        // for the reaped worldline builds a fresh sandbox.
        manager.execute("worldline_b", "y", 30).await.unwrap();
        assert_eq!(runner.starts.lock().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let runner = Arc::new(StubRunner::new());
        let manager = SandboxManager::new(runner.clone(), 3, 16);
        manager.execute("worldline_a", "x", 30).await.unwrap();
        manager.execute("worldline_b", "y", 30).await.unwrap();

        let mut stopped = manager.shutdown_all().await;
        stopped.sort();
        assert_eq!(stopped, vec!["worldline_a".to_string(), "worldline_b".to_string()]);
        assert_eq!(manager.pool_status().active, 0);
        assert_eq!(runner.stops.lock().len(), 2);
    }
}
