//! Durable chat-turn job scheduler.
//!
//! Jobs are enqueued as `queued` rows and executed by background tasks
//! that go through the turn coordinator (so scheduled turns share the
//! per-worldline FIFO with inline turns) and the turn pool (so they
//! respect the same global cap). On startup, `running` rows are reset
//! to `queued` and rescheduled: at-least-once semantics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use wl_domain::job::{ChatTurnJob, JobLineage, JobStatus, JobSummary, TurnRequest};
use wl_domain::turn::TurnOutcome;
use wl_domain::Result;
use wl_store::MetaStore;

use crate::capacity::CapacityController;
use crate::coordinator::TurnCoordinator;
use crate::signals::TurnSignals;

/// Executes one turn for the scheduler. Implemented by the service
/// wiring so the scheduler stays decoupled from engine construction.
#[async_trait::async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run_turn(
        &self,
        worldline_id: &str,
        request: &TurnRequest,
        signals: &TurnSignals,
    ) -> Result<TurnOutcome>;
}

struct SchedulerInner {
    store: Arc<MetaStore>,
    coordinator: TurnCoordinator,
    capacity: Arc<CapacityController>,
    runner: Arc<dyn TurnRunner>,
    started: Mutex<bool>,
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

/// Clonable scheduler handle.
#[derive(Clone)]
pub struct ChatJobScheduler {
    inner: Arc<SchedulerInner>,
}

impl ChatJobScheduler {
    pub fn new(
        store: Arc<MetaStore>,
        coordinator: TurnCoordinator,
        capacity: Arc<CapacityController>,
        runner: Arc<dyn TurnRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                coordinator,
                capacity,
                runner,
                started: Mutex::new(false),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Insert a durable `queued` row. The caller still needs
    /// [`schedule`](Self::schedule) (or the next [`start`](Self::start))
    /// to execute it.
    pub fn enqueue(
        &self,
        thread_id: &str,
        worldline_id: &str,
        request: &TurnRequest,
        lineage: &JobLineage,
    ) -> Result<ChatTurnJob> {
        let job = self
            .inner
            .store
            .insert_job(thread_id, worldline_id, request, lineage)?;
        tracing::info!(
            job_id = %job.id,
            worldline_id,
            queue_position = job.queue_position.unwrap_or(0),
            "enqueued chat turn job"
        );
        Ok(job)
    }

    /// Idempotent startup: crash recovery plus scheduling of every
    /// currently-queued job.
    pub async fn start(&self) -> Result<()> {
        {
            let mut started = self.inner.started.lock();
            if *started {
                return Ok(());
            }
            *started = true;
        }

        let queued = self.inner.store.recover_interrupted_jobs()?;
        tracing::info!(count = queued.len(), "scheduling recovered queued jobs");
        for job_id in queued {
            self.schedule_without_start(&job_id);
        }
        Ok(())
    }

    /// Schedule one job, starting the scheduler first if needed.
    pub async fn schedule(&self, job_id: &str) -> Result<()> {
        self.start().await?;
        self.schedule_without_start(job_id);
        Ok(())
    }

    fn schedule_without_start(&self, job_id: &str) {
        if !*self.inner.started.lock() {
            return;
        }

        let mut tasks = self.inner.tasks.lock();
        if let Some(existing) = tasks.get(job_id) {
            if !existing.is_finished() {
                return;
            }
        }

        let scheduler = self.clone();
        let id = job_id.to_string();
        let task_id = id.clone();
        tasks.insert(
            task_id,
            tokio::spawn(async move {
                scheduler.run_job(&id).await;
                scheduler.inner.tasks.lock().remove(&id);
            }),
        );
    }

    async fn run_job(&self, job_id: &str) {
        let job = match self.inner.store.job(job_id) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(job_id, error = %err, "job load failed");
                return;
            }
        };
        if job.status != JobStatus::Queued {
            return;
        }

        let scheduler = self.clone();
        let worldline_id = job.worldline_id.clone();
        let request = job.request.clone();
        let id = job_id.to_string();

        let outcome = self
            .inner
            .coordinator
            .run(&job.worldline_id, move || async move {
                scheduler.execute_job(&id, &worldline_id, &request).await
            })
            .await;

        if let Err(err) = outcome {
            // Coordinator shutdown or an aborted worker: leave the row
            // alone — a queued/running row is recovered at next start.
            tracing::debug!(job_id, error = %err, "scheduled job did not run");
        }
    }

    /// The body executed at the head of the worldline queue: claim the
    /// row, take a turn lease, run the turn, and record the terminal
    /// status.
    async fn execute_job(
        &self,
        job_id: &str,
        worldline_id: &str,
        request: &TurnRequest,
    ) -> Result<()> {
        if !self.inner.store.mark_job_running(job_id)? {
            // The row left `queued` (cancelled, or claimed elsewhere).
            return Ok(());
        }

        let result = async {
            let _lease = self.inner.capacity.lease_turn().await?;
            self.inner
                .runner
                .run_turn(worldline_id, request, &TurnSignals::none())
                .await
        }
        .await;

        match result {
            Ok(outcome) => {
                let summary = JobSummary::from_turn(&outcome.events);
                self.inner
                    .store
                    .mark_job_completed(job_id, &outcome.worldline_id, &summary)?;
                tracing::info!(
                    job_id,
                    result_worldline_id = %outcome.worldline_id,
                    event_count = summary.event_count,
                    "job completed"
                );
            }
            Err(err) => {
                tracing::warn!(job_id, error = %err, "job failed");
                self.inner.store.mark_job_failed(job_id, &err.to_string())?;
            }
        }
        Ok(())
    }

    /// Cancel background scheduling tasks. In-flight turns finish via
    /// the coordinator's normal path; new scheduling stops.
    pub async fn shutdown(&self) {
        *self.inner.started.lock() = false;
        let tasks = {
            let mut tasks = self.inner.tasks.lock();
            std::mem::take(&mut *tasks)
        };
        for (_, task) in &tasks {
            task.abort();
        }
        for (_, task) in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wl_domain::event::{EventRecord, EventType};
    use wl_domain::Error;

    /// Runner that fabricates a one-event outcome, or fails on demand.
    struct StubRunner {
        fail_with: Option<String>,
        delay: Option<std::time::Duration>,
    }

    #[async_trait::async_trait]
    impl TurnRunner for StubRunner {
        async fn run_turn(
            &self,
            worldline_id: &str,
            request: &TurnRequest,
            _signals: &TurnSignals,
        ) -> Result<TurnOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.fail_with {
                return Err(Error::llm(message.clone()));
            }
            Ok(TurnOutcome {
                worldline_id: worldline_id.to_string(),
                events: vec![EventRecord {
                    id: "event_done".into(),
                    worldline_id: worldline_id.to_string(),
                    parent_event_id: None,
                    event_type: EventType::AssistantMessage,
                    payload: serde_json::json!({"text": format!("answered: {}", request.message)}),
                    created_at: String::new(),
                }],
            })
        }
    }

    fn harness(runner: StubRunner) -> (TempDir, Arc<MetaStore>, ChatJobScheduler, String, String) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MetaStore::open(tmp.path()).unwrap());
        let thread = store.create_thread(None).unwrap();
        let wid = store.create_worldline(&thread.id, None).unwrap().id;
        let scheduler = ChatJobScheduler::new(
            store.clone(),
            TurnCoordinator::new(),
            Arc::new(CapacityController::new(&wl_domain::config::RuntimeConfig::default())),
            Arc::new(runner),
        );
        (tmp, store, scheduler, thread.id, wid)
    }

    async fn wait_terminal(store: &MetaStore, job_id: &str) -> ChatTurnJob {
        for _ in 0..200 {
            let job = store.job(job_id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn scheduled_job_completes_with_summary() {
        let (_tmp, store, scheduler, tid, wid) = harness(StubRunner {
            fail_with: None,
            delay: None,
        });
        let job = scheduler
            .enqueue(&tid, &wid, &TurnRequest::new("hello"), &JobLineage::default())
            .unwrap();
        scheduler.schedule(&job.id).await.unwrap();

        let done = wait_terminal(&store, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_worldline_id.as_deref(), Some(wid.as_str()));
        let summary = done.result_summary.unwrap();
        assert_eq!(summary.event_count, 1);
        assert!(summary.assistant_preview.starts_with("answered: hello"));
    }

    #[tokio::test]
    async fn failed_turn_marks_job_failed() {
        let (_tmp, store, scheduler, tid, wid) = harness(StubRunner {
            fail_with: Some("provider melted".into()),
            delay: None,
        });
        let job = scheduler
            .enqueue(&tid, &wid, &TurnRequest::new("hello"), &JobLineage::default())
            .unwrap();
        scheduler.schedule(&job.id).await.unwrap();

        let done = wait_terminal(&store, &job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("provider melted"));
    }

    #[tokio::test]
    async fn start_recovers_interrupted_jobs() {
        let (_tmp, store, scheduler, tid, wid) = harness(StubRunner {
            fail_with: None,
            delay: None,
        });
        let job = scheduler
            .enqueue(&tid, &wid, &TurnRequest::new("resume me"), &JobLineage::default())
            .unwrap();
        // Simulate a crash mid-run: the row is `running` with no task.
        store.mark_job_running(&job.id).unwrap();
        assert_eq!(store.job(&job.id).unwrap().status, JobStatus::Running);

        scheduler.start().await.unwrap();
        let done = wait_terminal(&store, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_job_is_not_executed() {
        let (_tmp, store, scheduler, tid, wid) = harness(StubRunner {
            fail_with: None,
            delay: None,
        });
        let job = scheduler
            .enqueue(&tid, &wid, &TurnRequest::new("never"), &JobLineage::default())
            .unwrap();
        store.cancel_job(&job.id).unwrap();

        scheduler.schedule(&job.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.job(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn duplicate_schedule_is_a_noop() {
        let (_tmp, store, scheduler, tid, wid) = harness(StubRunner {
            fail_with: None,
            delay: Some(std::time::Duration::from_millis(30)),
        });
        let job = scheduler
            .enqueue(&tid, &wid, &TurnRequest::new("slow"), &JobLineage::default())
            .unwrap();
        scheduler.schedule(&job.id).await.unwrap();
        scheduler.schedule(&job.id).await.unwrap();
        scheduler.schedule(&job.id).await.unwrap();

        let done = wait_terminal(&store, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
    }
}
