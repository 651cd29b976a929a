//! Durable chat-turn job rows and their lifecycle transitions.
//!
//! `queued → running` is a conditional update; zero changed rows means
//! another scheduler task won the job and the caller must back off.

use rusqlite::OptionalExtension;
use wl_domain::id::new_id;
use wl_domain::job::{ChatTurnJob, JobLineage, JobStatus, JobSummary, TurnRequest};
use wl_domain::tool::truncate_str;
use wl_domain::{Error, Result};

use crate::MetaStore;

const ERROR_MAX_CHARS: usize = 4000;

impl MetaStore {
    pub fn insert_job(
        &self,
        thread_id: &str,
        worldline_id: &str,
        request: &TurnRequest,
        lineage: &JobLineage,
    ) -> Result<ChatTurnJob> {
        let id = new_id("job");
        let created_at = self.now();
        let request_json = serde_json::to_string(request)?;

        let queue_position = {
            let conn = self.conn.lock();
            let ahead: u64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_turn_jobs WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO chat_turn_jobs
                 (id, thread_id, worldline_id, request_json, parent_job_id, fanout_group_id,
                  task_label, parent_tool_call_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9)",
                rusqlite::params![
                    id,
                    thread_id,
                    worldline_id,
                    request_json,
                    lineage.parent_job_id,
                    lineage.fanout_group_id,
                    lineage.task_label,
                    lineage.parent_tool_call_id,
                    created_at,
                ],
            )?;
            ahead
        };

        Ok(ChatTurnJob {
            id,
            thread_id: thread_id.to_string(),
            worldline_id: worldline_id.to_string(),
            request: request.clone(),
            lineage: lineage.clone(),
            status: JobStatus::Queued,
            error: None,
            result_worldline_id: None,
            result_summary: None,
            created_at,
            started_at: None,
            finished_at: None,
            queue_position: Some(queue_position),
        })
    }

    pub fn job(&self, job_id: &str) -> Result<ChatTurnJob> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, thread_id, worldline_id, request_json, parent_job_id, fanout_group_id,
                    task_label, parent_tool_call_id, status, error, result_worldline_id,
                    result_summary_json, created_at, started_at, finished_at
             FROM chat_turn_jobs WHERE id = ?1",
            rusqlite::params![job_id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("job {job_id}")))
    }

    pub fn list_jobs(
        &self,
        worldline_id: Option<&str>,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<ChatTurnJob>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, thread_id, worldline_id, request_json, parent_job_id, fanout_group_id,
                    task_label, parent_tool_call_id, status, error, result_worldline_id,
                    result_summary_json, created_at, started_at, finished_at
             FROM chat_turn_jobs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(wid) = worldline_id {
            sql.push_str(" AND worldline_id = ?");
            params.push(Box::new(wid.to_string()));
        }
        if !statuses.is_empty() {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({placeholders})"));
            for status in statuses {
                params.push(Box::new(status.as_str().to_string()));
            }
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        params.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())), row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// `queued → running`. Returns false when the row has already left
    /// `queued` (another task claimed it, or it was cancelled).
    pub fn mark_job_running(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE chat_turn_jobs
             SET status = 'running', started_at = ?1, error = NULL
             WHERE id = ?2 AND status = 'queued'",
            rusqlite::params![self.now(), job_id],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_job_completed(
        &self,
        job_id: &str,
        result_worldline_id: &str,
        summary: &JobSummary,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE chat_turn_jobs
             SET status = 'completed', result_worldline_id = ?1, result_summary_json = ?2,
                 error = NULL, finished_at = ?3
             WHERE id = ?4",
            rusqlite::params![
                result_worldline_id,
                serde_json::to_string(summary)?,
                self.now(),
                job_id,
            ],
        )?;
        Ok(())
    }

    pub fn mark_job_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE chat_turn_jobs
             SET status = 'failed', error = ?1, finished_at = ?2
             WHERE id = ?3",
            rusqlite::params![truncate_str(error, ERROR_MAX_CHARS), self.now(), job_id],
        )?;
        Ok(())
    }

    /// Cancel a job that has not reached a terminal state. Returns false
    /// for terminal (or unknown) jobs.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE chat_turn_jobs
             SET status = 'cancelled', finished_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'running')",
            rusqlite::params![self.now(), job_id],
        )?;
        Ok(changed > 0)
    }

    /// Crash recovery: reset every `running` job to `queued` and return
    /// all queued job ids in `created_at, id` order.
    pub fn recover_interrupted_jobs(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let reset = conn.execute(
            "UPDATE chat_turn_jobs SET status = 'queued', started_at = NULL
             WHERE status = 'running'",
            [],
        )?;
        if reset > 0 {
            tracing::info!(count = reset, "reset interrupted jobs to queued");
        }

        let mut stmt = conn.prepare(
            "SELECT id FROM chat_turn_jobs WHERE status = 'queued'
             ORDER BY created_at ASC, id ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatTurnJob> {
    let request_json: String = row.get(3)?;
    let status_raw: String = row.get(8)?;
    let summary_json: Option<String> = row.get(11)?;
    Ok(ChatTurnJob {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        worldline_id: row.get(2)?,
        request: serde_json::from_str(&request_json).unwrap_or_else(|_| TurnRequest::new("")),
        lineage: JobLineage {
            parent_job_id: row.get(4)?,
            fanout_group_id: row.get(5)?,
            task_label: row.get(6)?,
            parent_tool_call_id: row.get(7)?,
        },
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Failed),
        error: row.get(9)?,
        result_worldline_id: row.get(10)?,
        result_summary: summary_json.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        finished_at: row.get(14)?,
        queue_position: None,
    })
}
