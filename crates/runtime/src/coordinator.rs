//! Per-worldline turn serialization.
//!
//! Each worldline gets a FIFO queue and a single worker task; at most
//! one turn executes per worldline while distinct worldlines proceed in
//! parallel (bounded only by the turn pool). Worker and queue entries
//! are removed under the coordinator lock once the queue drains.
//!
//! The coordinator is a cheap clonable handle over shared state, so
//! subagent code can carry it into child turns without process-wide
//! singletons.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wl_domain::{Error, Result};

/// A queued submission: runs the factory and delivers the result over
/// its own oneshot channel.
type QueuedTurn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct CoordinatorState {
    queues: HashMap<String, VecDeque<QueuedTurn>>,
    workers: HashMap<String, JoinHandle<()>>,
    shutdown: bool,
}

#[derive(Clone, Default)]
pub struct TurnCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
}

impl TurnCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit one turn for the worldline. The factory is invoked when
    /// the submission reaches the head of the worldline's queue;
    /// submissions execute in arrival order.
    pub async fn run<T, F, Fut>(&self, worldline_id: &str, factory: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let job: QueuedTurn = Box::new(move || {
            async move {
                let _ = tx.send(factory().await);
            }
            .boxed()
        });

        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(Error::shutdown("worldline turn coordinator is shutting down"));
            }
            state
                .queues
                .entry(worldline_id.to_string())
                .or_default()
                .push_back(job);

            let needs_worker = state
                .workers
                .get(worldline_id)
                .map(|worker| worker.is_finished())
                .unwrap_or(true);
            if needs_worker {
                let coordinator = self.clone();
                let wid = worldline_id.to_string();
                state
                    .workers
                    .insert(wid.clone(), tokio::spawn(worker_loop(coordinator, wid)));
            }
        }

        // A dropped sender means the job was discarded at shutdown.
        rx.await
            .unwrap_or_else(|_| Err(Error::shutdown("worldline turn coordinator is shutting down")))
    }

    /// Number of worldlines with an active worker (for monitoring).
    pub fn active_worldlines(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Fail pending submissions and cancel workers. The currently
    /// executing factory (if any) is aborted with its worker.
    pub async fn shutdown(&self) {
        let (queues, workers) = {
            let mut state = self.state.lock();
            state.shutdown = true;
            (
                std::mem::take(&mut state.queues),
                std::mem::take(&mut state.workers),
            )
        };

        // Dropping queued jobs drops their result senders; waiting
        // callers observe the shutdown error.
        drop(queues);

        for (_, worker) in &workers {
            worker.abort();
        }
        for (_, worker) in workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(coordinator: TurnCoordinator, worldline_id: String) {
    loop {
        let job = {
            let mut state = coordinator.state.lock();
            match state.queues.get_mut(&worldline_id) {
                None => {
                    state.workers.remove(&worldline_id);
                    return;
                }
                Some(queue) => match queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.queues.remove(&worldline_id);
                        state.workers.remove(&worldline_id);
                        return;
                    }
                },
            }
        };
        job().await;
    }
}
