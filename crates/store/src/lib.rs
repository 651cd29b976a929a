//! Metadata store: threads, worldlines, the append-only event log,
//! snapshots, artifacts, and durable chat-turn jobs, all in one SQLite
//! file under the data root.
//!
//! The single write primitive for timelines is
//! [`MetaStore::append_and_advance`]: callers never read a head and
//! append against it in two separate steps.

mod artifacts;
mod events;
mod jobs;
mod worldlines;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use wl_datadb::DataDb;
use wl_domain::event::EventRecord;
use wl_domain::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS worldlines (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    parent_worldline_id TEXT NULL,
    forked_from_event_id TEXT NULL,
    head_event_id TEXT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (thread_id) REFERENCES threads(id)
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    worldline_id TEXT NOT NULL,
    parent_event_id TEXT NULL,
    type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (worldline_id) REFERENCES worldlines(id)
);
CREATE INDEX IF NOT EXISTS idx_events_worldline ON events(worldline_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    worldline_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    db_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (worldline_id) REFERENCES worldlines(id),
    FOREIGN KEY (event_id) REFERENCES events(id)
);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    worldline_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (worldline_id) REFERENCES worldlines(id),
    FOREIGN KEY (event_id) REFERENCES events(id)
);

CREATE TABLE IF NOT EXISTS chat_turn_jobs (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    worldline_id TEXT NOT NULL,
    request_json TEXT NOT NULL,
    parent_job_id TEXT NULL,
    fanout_group_id TEXT NULL,
    task_label TEXT NULL,
    parent_tool_call_id TEXT NULL,
    status TEXT NOT NULL,
    error TEXT NULL,
    result_worldline_id TEXT NULL,
    result_summary_json TEXT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT NULL,
    finished_at TEXT NULL
);
";

/// Bound on the `(worldline, head) → history` cache.
const HISTORY_CACHE_CAP: usize = 64;

pub struct MetaStore {
    conn: Mutex<Connection>,
    datadb: DataDb,
    history_cache: Mutex<HashMap<(String, String), Arc<Vec<EventRecord>>>>,
}

impl MetaStore {
    /// Open (creating if needed) the metadata DB under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("meta.db"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            datadb: DataDb::new(data_dir),
            history_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn datadb(&self) -> &DataDb {
        &self.datadb
    }

    pub(crate) fn now(&self) -> String {
        chrono::Utc::now().to_rfc3339()
    }

    pub(crate) fn cache_history(&self, worldline_id: &str, head: &str, events: Arc<Vec<EventRecord>>) {
        let mut cache = self.history_cache.lock();
        if cache.len() >= HISTORY_CACHE_CAP {
            cache.clear();
        }
        cache.insert((worldline_id.to_string(), head.to_string()), events);
    }

    pub(crate) fn cached_history(&self, worldline_id: &str, head: &str) -> Option<Arc<Vec<EventRecord>>> {
        self.history_cache
            .lock()
            .get(&(worldline_id.to_string(), head.to_string()))
            .cloned()
    }
}
