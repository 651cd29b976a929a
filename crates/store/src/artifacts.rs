//! Artifact and snapshot rows.

use rusqlite::OptionalExtension;
use wl_domain::id::new_id;
use wl_domain::worldline::{ArtifactRecord, SnapshotRecord};
use wl_domain::Result;

use crate::MetaStore;

impl MetaStore {
    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn create_artifact(
        &self,
        worldline_id: &str,
        event_id: &str,
        artifact_type: &str,
        name: &str,
        path: &str,
    ) -> Result<ArtifactRecord> {
        let id = new_id("artifact");
        self.create_artifact_with_id(&id, worldline_id, event_id, artifact_type, name, path)
    }

    /// Insert an artifact under a pre-allocated id (used when the id has
    /// already been written into a tool-result payload).
    pub fn create_artifact_with_id(
        &self,
        id: &str,
        worldline_id: &str,
        event_id: &str,
        artifact_type: &str,
        name: &str,
        path: &str,
    ) -> Result<ArtifactRecord> {
        let record = ArtifactRecord {
            id: id.to_string(),
            worldline_id: worldline_id.to_string(),
            event_id: event_id.to_string(),
            artifact_type: artifact_type.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            created_at: self.now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO artifacts (id, worldline_id, event_id, type, name, path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.id,
                record.worldline_id,
                record.event_id,
                record.artifact_type,
                record.name,
                record.path,
                record.created_at,
            ],
        )?;
        Ok(record)
    }

    pub fn artifacts_for_worldline(&self, worldline_id: &str) -> Result<Vec<ArtifactRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, worldline_id, event_id, type, name, path, created_at
             FROM artifacts WHERE worldline_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![worldline_id], row_to_artifact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn artifacts_for_event(&self, event_id: &str) -> Result<Vec<ArtifactRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, worldline_id, event_id, type, name, path, created_at
             FROM artifacts WHERE event_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![event_id], row_to_artifact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    /// Copy the worldline's analytical DB into the snapshot tree and
    /// record the row.
    pub fn create_snapshot(&self, worldline_id: &str, event_id: &str) -> Result<SnapshotRecord> {
        let db_path = self.datadb().capture_snapshot(worldline_id, event_id)?;
        let record = SnapshotRecord {
            id: new_id("snapshot"),
            worldline_id: worldline_id.to_string(),
            event_id: event_id.to_string(),
            db_path: db_path.to_string_lossy().into_owned(),
            created_at: self.now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO snapshots (id, worldline_id, event_id, db_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.id,
                record.worldline_id,
                record.event_id,
                record.db_path,
                record.created_at,
            ],
        )?;
        Ok(record)
    }

    pub fn snapshot_for_event(&self, event_id: &str) -> Result<Option<SnapshotRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, worldline_id, event_id, db_path, created_at
                 FROM snapshots WHERE event_id = ?1
                 ORDER BY rowid DESC LIMIT 1",
                rusqlite::params![event_id],
                |row| {
                    Ok(SnapshotRecord {
                        id: row.get(0)?,
                        worldline_id: row.get(1)?,
                        event_id: row.get(2)?,
                        db_path: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Walk the ancestor chain starting at `from_event_id` (inclusive)
    /// and return the first snapshot found.
    pub fn nearest_snapshot_in_chain(&self, from_event_id: &str) -> Result<Option<SnapshotRecord>> {
        let mut cursor = Some(from_event_id.to_string());
        while let Some(event_id) = cursor {
            if let Some(snapshot) = self.snapshot_for_event(&event_id)? {
                return Ok(Some(snapshot));
            }
            cursor = self.event(&event_id)?.parent_event_id;
        }
        Ok(None)
    }
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        id: row.get(0)?,
        worldline_id: row.get(1)?,
        event_id: row.get(2)?,
        artifact_type: row.get(3)?,
        name: row.get(4)?,
        path: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::store;
    use serde_json::json;
    use wl_domain::event::EventType;

    #[test]
    fn artifacts_are_scoped_to_event_and_worldline() {
        let (_tmp, s) = store();
        let thread = s.create_thread(None).unwrap();
        let wid = s.create_worldline(&thread.id, None).unwrap().id;
        let event = s
            .append_event(&wid, EventType::ToolResultPython, &json!({"stdout": ""}))
            .unwrap();

        s.create_artifact(&wid, &event.id, "image", "plot.png", "/tmp/plot.png")
            .unwrap();
        s.create_artifact(&wid, &event.id, "csv", "out.csv", "/tmp/out.csv")
            .unwrap();

        assert_eq!(s.artifacts_for_worldline(&wid).unwrap().len(), 2);
        let by_event = s.artifacts_for_event(&event.id).unwrap();
        assert_eq!(by_event.len(), 2);
        assert_eq!(by_event[0].name, "plot.png");
    }

    #[test]
    fn nearest_snapshot_walks_ancestors() {
        let (_tmp, s) = store();
        let thread = s.create_thread(None).unwrap();
        let wid = s.create_worldline(&thread.id, None).unwrap().id;

        let first = s
            .append_event(&wid, EventType::UserMessage, &json!({"text": "one"}))
            .unwrap();
        let second = s
            .append_event(&wid, EventType::AssistantMessage, &json!({"text": "two"}))
            .unwrap();

        assert!(s.nearest_snapshot_in_chain(&second.id).unwrap().is_none());

        s.create_snapshot(&wid, &first.id).unwrap();
        let found = s.nearest_snapshot_in_chain(&second.id).unwrap().unwrap();
        assert_eq!(found.event_id, first.id);
        assert!(std::path::Path::new(&found.db_path).exists());
    }
}
