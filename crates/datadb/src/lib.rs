//! Per-worldline analytical database driver.
//!
//! Each worldline owns one embedded SQLite file under the data root
//! (`worldlines/<id>/state.db`) plus a `workspace/` directory for sandbox
//! artifacts. Branching clones the file; snapshots copy it into the
//! snapshots tree. External databases recorded in the `_external_sources`
//! metadata table are re-attached read-only on every connection, because
//! attachments are session-scoped.

mod external;
mod query;

pub use external::{AttachOutcome, ExternalSource};
pub use query::{SqlColumn, SqlQueryResult};

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use wl_domain::{Error, Result};

/// Stateless driver handle; cheap to clone.
#[derive(Debug, Clone)]
pub struct DataDb {
    data_dir: PathBuf,
}

impl DataDb {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ── Paths ─────────────────────────────────────────────────────────

    pub fn worldline_dir(&self, worldline_id: &str) -> PathBuf {
        self.data_dir.join("worldlines").join(worldline_id)
    }

    pub fn db_path(&self, worldline_id: &str) -> PathBuf {
        self.worldline_dir(worldline_id).join("state.db")
    }

    pub fn workspace_dir(&self, worldline_id: &str) -> PathBuf {
        self.worldline_dir(worldline_id).join("workspace")
    }

    pub fn snapshot_path(&self, worldline_id: &str, event_id: &str) -> PathBuf {
        self.data_dir
            .join("snapshots")
            .join(worldline_id)
            .join(format!("{event_id}.db"))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Create the worldline DB file if it does not exist yet.
    pub fn ensure_db(&self, worldline_id: &str) -> Result<PathBuf> {
        let path = self.db_path(worldline_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        drop(conn);
        Ok(path)
    }

    pub fn ensure_workspace(&self, worldline_id: &str) -> Result<PathBuf> {
        let dir = self.workspace_dir(worldline_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Clone the source worldline's DB into the target worldline.
    pub fn clone_db(&self, source_worldline_id: &str, target_worldline_id: &str) -> Result<PathBuf> {
        let source = self.db_path(source_worldline_id);
        self.clone_db_from_file(&source, target_worldline_id)
    }

    /// Clone an arbitrary DB file (live DB or snapshot) into the target
    /// worldline. A missing source yields a fresh empty DB.
    pub fn clone_db_from_file(&self, source: &Path, target_worldline_id: &str) -> Result<PathBuf> {
        let target = self.db_path(target_worldline_id);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if source.exists() {
            std::fs::copy(source, &target)?;
            return Ok(target);
        }
        self.ensure_db(target_worldline_id)
    }

    /// Copy the worldline's current DB into the snapshot tree, keyed by
    /// the event at which the snapshot was taken.
    pub fn capture_snapshot(&self, worldline_id: &str, event_id: &str) -> Result<PathBuf> {
        let source = self.ensure_db(worldline_id)?;
        let target = self.snapshot_path(worldline_id, event_id);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target)?;
        Ok(target)
    }

    // ── Connections ───────────────────────────────────────────────────

    /// Open a connection to the worldline DB, re-attaching external
    /// sources (optionally restricted to `allowed_aliases`).
    pub fn open(
        &self,
        worldline_id: &str,
        reattach_externals: bool,
        allowed_aliases: Option<&[String]>,
    ) -> Result<(Connection, Vec<AttachOutcome>)> {
        let path = self.ensure_db(worldline_id)?;
        let conn = Connection::open(path)?;
        let outcomes = if reattach_externals {
            external::reattach_external_sources(&conn, allowed_aliases)
        } else {
            Vec::new()
        };
        Ok((conn, outcomes))
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Run a read query, returning all-row counts and a preview capped at
    /// `limit`. Runs on the blocking pool; the connection lives for the
    /// duration of one query only.
    pub async fn execute_read(
        &self,
        worldline_id: &str,
        sql: &str,
        limit: usize,
        allowed_aliases: Option<Vec<String>>,
    ) -> Result<SqlQueryResult> {
        let db = self.clone();
        let worldline_id = worldline_id.to_string();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            db.execute_read_blocking(&worldline_id, &sql, limit, allowed_aliases.as_deref())
        })
        .await
        .map_err(|e| Error::Sandbox(format!("query task failed: {e}")))?
    }

    pub fn execute_read_blocking(
        &self,
        worldline_id: &str,
        sql: &str,
        limit: usize,
        allowed_aliases: Option<&[String]>,
    ) -> Result<SqlQueryResult> {
        let (conn, _) = self.open(worldline_id, true, allowed_aliases)?;
        query::run_read_query(&conn, sql, limit)
    }

    // ── External sources ──────────────────────────────────────────────

    pub fn register_external(&self, worldline_id: &str, alias: &str, db_path: &str) -> Result<()> {
        let (conn, _) = self.open(worldline_id, false, None)?;
        external::register_external(&conn, alias, db_path)
    }

    /// Returns whether an entry was removed.
    pub fn remove_external(&self, worldline_id: &str, alias: &str) -> Result<bool> {
        let (conn, _) = self.open(worldline_id, false, None)?;
        external::remove_external(&conn, alias)
    }

    pub fn list_externals(&self, worldline_id: &str) -> Result<Vec<ExternalSource>> {
        let (conn, _) = self.open(worldline_id, false, None)?;
        external::load_external_sources(&conn)
    }
}
