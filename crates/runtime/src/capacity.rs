//! Global bounded capacity pools: turn, subagent, python.
//!
//! Each pool is a counting semaphore with a hard queue cap: a caller
//! arriving when `waiters >= max_queue` is rejected with
//! [`Error::CapacityLimit`] without entering the pool. Leases record
//! their queue-wait duration for telemetry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use wl_domain::config::RuntimeConfig;
use wl_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lease
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A scoped admission token. Dropping it releases the slot.
#[derive(Debug)]
pub struct CapacityLease {
    pub wait_ms: u64,
    /// `Some("capacity_wait")` when the lease had to queue.
    pub queue_reason: Option<&'static str>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for CapacityLease {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct PoolShared {
    semaphore: Arc<Semaphore>,
    /// Callers blocked on the semaphore. Checked against `max_queue`
    /// under the lock so check-and-increment is atomic.
    waiters: Mutex<usize>,
    active: AtomicUsize,
}

struct CapacityPool {
    name: &'static str,
    max_concurrency: usize,
    max_queue: usize,
    shared: Arc<PoolShared>,
}

/// Decrements the waiter count even when the waiting future is dropped
/// (a fan-out deadline can cancel tasks mid-acquire).
struct WaiterGuard(Arc<PoolShared>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut waiters = self.0.waiters.lock();
        *waiters = waiters.saturating_sub(1);
    }
}

impl CapacityPool {
    fn new(name: &'static str, max_concurrency: usize, max_queue: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            name,
            max_concurrency,
            max_queue,
            shared: Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                waiters: Mutex::new(0),
                active: AtomicUsize::new(0),
            }),
        }
    }

    async fn lease(&self) -> Result<CapacityLease> {
        let start = Instant::now();

        {
            let mut waiters = self.shared.waiters.lock();
            if *waiters >= self.max_queue {
                return Err(Error::CapacityLimit(format!(
                    "{} queue limit reached ({})",
                    self.name, self.max_queue
                )));
            }
            *waiters += 1;
        }

        let guard = WaiterGuard(self.shared.clone());
        let permit = self
            .shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::shutdown(format!("{} pool closed", self.name)))?;
        drop(guard);

        self.shared.active.fetch_add(1, Ordering::AcqRel);
        let wait_ms = start.elapsed().as_millis() as u64;
        Ok(CapacityLease {
            wait_ms,
            queue_reason: (wait_ms > 0).then_some("capacity_wait"),
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            max: self.max_concurrency,
            active: self.shared.active.load(Ordering::Acquire),
            queued: *self.shared.waiters.lock(),
            available: self.shared.semaphore.available_permits(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub max: usize,
    pub active: usize,
    pub queued: usize,
    pub available: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacitySnapshot {
    pub turn: PoolSnapshot,
    pub subagent: PoolSnapshot,
    pub python: PoolSnapshot,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CapacityController {
    turn: CapacityPool,
    subagent: CapacityPool,
    python: CapacityPool,
}

impl CapacityController {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            turn: CapacityPool::new("turn", config.turn_max_concurrency, config.turn_max_queue),
            subagent: CapacityPool::new(
                "subagent",
                config.subagent_max_concurrency,
                config.subagent_max_queue,
            ),
            python: CapacityPool::new(
                "python",
                config.python_max_concurrency,
                config.python_max_queue,
            ),
        }
    }

    /// Process-wide instance, limits read from the environment on first
    /// use. Constructors stay public for tests.
    pub fn global() -> &'static CapacityController {
        static GLOBAL: OnceLock<CapacityController> = OnceLock::new();
        GLOBAL.get_or_init(|| CapacityController::new(&RuntimeConfig::from_env()))
    }

    pub async fn lease_turn(&self) -> Result<CapacityLease> {
        self.turn.lease().await
    }

    pub async fn lease_subagent(&self) -> Result<CapacityLease> {
        self.subagent.lease().await
    }

    pub async fn lease_python(&self) -> Result<CapacityLease> {
        self.python.lease().await
    }

    pub fn subagent_max_concurrency(&self) -> usize {
        self.subagent.max_concurrency
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            turn: self.turn.snapshot(),
            subagent: self.subagent.snapshot(),
            python: self.python.snapshot(),
        }
    }
}
