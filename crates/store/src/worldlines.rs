//! Thread / worldline registry and branch creation.

use rusqlite::OptionalExtension;
use wl_domain::event::EventType;
use wl_domain::id::new_id;
use wl_domain::worldline::{BranchOptions, BranchResult, ThreadRow, WorldlineRow};
use wl_domain::{Error, Result};

use crate::MetaStore;

impl MetaStore {
    // ── Threads ───────────────────────────────────────────────────────

    pub fn create_thread(&self, title: Option<&str>) -> Result<ThreadRow> {
        let row = ThreadRow {
            id: new_id("thread"),
            title: title.map(str::to_string),
            created_at: self.now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO threads (id, title, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![row.id, row.title, row.created_at],
        )?;
        Ok(row)
    }

    pub fn thread(&self, thread_id: &str) -> Result<ThreadRow> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, title, created_at FROM threads WHERE id = ?1",
            rusqlite::params![thread_id],
            |row| {
                Ok(ThreadRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("thread {thread_id}")))
    }

    // ── Worldlines ────────────────────────────────────────────────────

    pub fn create_worldline(&self, thread_id: &str, name: Option<&str>) -> Result<WorldlineRow> {
        self.thread(thread_id)?;
        let row = WorldlineRow {
            id: new_id("worldline"),
            thread_id: thread_id.to_string(),
            parent_worldline_id: None,
            forked_from_event_id: None,
            head_event_id: None,
            name: name.unwrap_or("main").to_string(),
            created_at: self.now(),
        };
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO worldlines
                 (id, thread_id, parent_worldline_id, forked_from_event_id, head_event_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.id,
                    row.thread_id,
                    row.parent_worldline_id,
                    row.forked_from_event_id,
                    row.head_event_id,
                    row.name,
                    row.created_at,
                ],
            )?;
        }
        self.datadb().ensure_db(&row.id)?;
        self.datadb().ensure_workspace(&row.id)?;
        Ok(row)
    }

    pub fn worldline(&self, worldline_id: &str) -> Result<WorldlineRow> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, thread_id, parent_worldline_id, forked_from_event_id, head_event_id, name, created_at
             FROM worldlines WHERE id = ?1",
            rusqlite::params![worldline_id],
            |row| {
                Ok(WorldlineRow {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    parent_worldline_id: row.get(2)?,
                    forked_from_event_id: row.get(3)?,
                    head_event_id: row.get(4)?,
                    name: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("worldline {worldline_id}")))
    }

    pub fn worldlines_for_thread(&self, thread_id: &str) -> Result<Vec<WorldlineRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, parent_worldline_id, forked_from_event_id, head_event_id, name, created_at
             FROM worldlines WHERE thread_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![thread_id], |row| {
                Ok(WorldlineRow {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    parent_worldline_id: row.get(2)?,
                    forked_from_event_id: row.get(3)?,
                    head_event_id: row.get(4)?,
                    name: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Branching ─────────────────────────────────────────────────────

    /// Create a new worldline forked from `from_event_id`, materialize
    /// its analytical DB (live copy for a head fork, nearest snapshot
    /// ancestor otherwise), and optionally write the three-event
    /// prologue chained from the fork point.
    pub fn branch_from_event(&self, options: &BranchOptions) -> Result<BranchResult> {
        let source = self.worldline(&options.source_worldline_id)?;
        let fork_event = self.event(&options.from_event_id)?;
        if fork_event.worldline_id != source.id {
            return Err(Error::bad_request(
                "from_event_id does not belong to source worldline",
            ));
        }

        let name = options
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| {
                let tail: String = options
                    .from_event_id
                    .chars()
                    .rev()
                    .take(6)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                format!("branch-{tail}")
            });

        let new_worldline_id = new_id("worldline");
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO worldlines
                 (id, thread_id, parent_worldline_id, forked_from_event_id, head_event_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    new_worldline_id,
                    source.thread_id,
                    source.id,
                    options.from_event_id,
                    options.from_event_id,
                    name,
                    self.now(),
                ],
            )?;
        }

        // Materialize the branch's analytical DB.
        let is_head_fork = source.head_event_id.as_deref() == Some(options.from_event_id.as_str());
        if is_head_fork {
            self.datadb().clone_db(&source.id, &new_worldline_id)?;
        } else {
            match self.nearest_snapshot_in_chain(&options.from_event_id)? {
                Some(snapshot) => {
                    self.datadb()
                        .clone_db_from_file(std::path::Path::new(&snapshot.db_path), &new_worldline_id)?;
                }
                None => {
                    tracing::debug!(
                        worldline_id = %new_worldline_id,
                        from_event_id = %options.from_event_id,
                        "no snapshot ancestor for historical fork, starting empty"
                    );
                    self.datadb().ensure_db(&new_worldline_id)?;
                }
            }
        }
        self.datadb().ensure_workspace(&new_worldline_id)?;

        let mut created_event_ids = Vec::new();
        if options.append_events {
            let branch_meta = serde_json::json!({
                "source_worldline_id": source.id,
                "from_event_id": options.from_event_id,
                "name": name,
            });
            let created = self.append_and_advance(
                &new_worldline_id,
                Some(&options.from_event_id),
                EventType::WorldlineCreated,
                &branch_meta,
            )?;
            let travel = self.append_and_advance(
                &new_worldline_id,
                Some(&created.id),
                EventType::TimeTravel,
                &branch_meta,
            )?;
            created_event_ids.push(created.id);
            created_event_ids.push(travel.id.clone());
            if let Some(text) = &options.carried_user_message {
                let carried = self.append_and_advance(
                    &new_worldline_id,
                    Some(&travel.id),
                    EventType::UserMessage,
                    &serde_json::json!({"text": text}),
                )?;
                created_event_ids.push(carried.id);
            }
        }

        tracing::info!(
            source_worldline_id = %source.id,
            new_worldline_id = %new_worldline_id,
            from_event_id = %options.from_event_id,
            head_fork = is_head_fork,
            prologue = options.append_events,
            "branched worldline"
        );

        Ok(BranchResult {
            new_worldline_id,
            thread_id: source.thread_id,
            source_worldline_id: source.id,
            from_event_id: options.from_event_id.clone(),
            name,
            created_event_ids,
            switched: options.append_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::store;
    use serde_json::json;

    #[test]
    fn branch_with_prologue_creates_three_event_chain() {
        let (_tmp, s) = store();
        let thread = s.create_thread(Some("t")).unwrap();
        let wid = s.create_worldline(&thread.id, Some("main")).unwrap().id;
        let anchor = s
            .append_event(&wid, EventType::AssistantMessage, &json!({"text": "anchor"}))
            .unwrap();

        let result = s
            .branch_from_event(&BranchOptions {
                source_worldline_id: wid.clone(),
                from_event_id: anchor.id.clone(),
                name: Some("alt".into()),
                append_events: true,
                carried_user_message: Some("carry this prompt".into()),
            })
            .unwrap();

        assert!(result.new_worldline_id.starts_with("worldline_"));
        assert_eq!(result.thread_id, thread.id);
        assert_eq!(result.created_event_ids.len(), 3);
        assert!(result.switched);

        let row = s.worldline(&result.new_worldline_id).unwrap();
        assert_eq!(row.parent_worldline_id.as_deref(), Some(wid.as_str()));
        assert_eq!(row.forked_from_event_id.as_deref(), Some(anchor.id.as_str()));
        assert_eq!(
            row.head_event_id.as_deref(),
            Some(result.created_event_ids[2].as_str())
        );

        // Prologue order and parent chain back to the fork point.
        let created = s.event(&result.created_event_ids[0]).unwrap();
        let travel = s.event(&result.created_event_ids[1]).unwrap();
        let carried = s.event(&result.created_event_ids[2]).unwrap();
        assert_eq!(created.event_type, EventType::WorldlineCreated);
        assert_eq!(created.parent_event_id.as_deref(), Some(anchor.id.as_str()));
        assert_eq!(travel.event_type, EventType::TimeTravel);
        assert_eq!(travel.parent_event_id.as_deref(), Some(created.id.as_str()));
        assert_eq!(carried.event_type, EventType::UserMessage);
        assert_eq!(carried.text(), Some("carry this prompt"));

        // History of the branch crosses the fork into the parent.
        let history = s.rebuild_history(&result.new_worldline_id).unwrap();
        assert_eq!(history[0].id, anchor.id);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn branch_without_prologue_keeps_fork_head() {
        let (_tmp, s) = store();
        let thread = s.create_thread(None).unwrap();
        let wid = s.create_worldline(&thread.id, None).unwrap().id;
        let anchor = s
            .append_event(&wid, EventType::AssistantMessage, &json!({"text": "anchor"}))
            .unwrap();

        let result = s
            .branch_from_event(&BranchOptions {
                source_worldline_id: wid.clone(),
                from_event_id: anchor.id.clone(),
                name: None,
                append_events: false,
                carried_user_message: None,
            })
            .unwrap();

        assert!(!result.switched);
        assert!(result.created_event_ids.is_empty());
        assert!(result.name.starts_with("branch-"));
        let row = s.worldline(&result.new_worldline_id).unwrap();
        assert_eq!(row.head_event_id.as_deref(), Some(anchor.id.as_str()));
    }

    #[test]
    fn branch_rejects_foreign_event() {
        let (_tmp, s) = store();
        let thread = s.create_thread(None).unwrap();
        let wid_a = s.create_worldline(&thread.id, None).unwrap().id;
        let wid_b = s.create_worldline(&thread.id, None).unwrap().id;
        let event_b = s
            .append_event(&wid_b, EventType::UserMessage, &json!({"text": "b"}))
            .unwrap();

        let err = s
            .branch_from_event(&BranchOptions {
                source_worldline_id: wid_a,
                from_event_id: event_b.id,
                name: None,
                append_events: false,
                carried_user_message: None,
            })
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn head_fork_clones_live_db() {
        let (_tmp, s) = store();
        let thread = s.create_thread(None).unwrap();
        let wid = s.create_worldline(&thread.id, None).unwrap().id;
        let anchor = s
            .append_event(&wid, EventType::UserMessage, &json!({"text": "seed"}))
            .unwrap();

        // Put data into the live DB.
        let (conn, _) = s.datadb().open(&wid, false, None).unwrap();
        conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (9);")
            .unwrap();
        drop(conn);

        let result = s
            .branch_from_event(&BranchOptions {
                source_worldline_id: wid,
                from_event_id: anchor.id,
                name: None,
                append_events: false,
                carried_user_message: None,
            })
            .unwrap();

        let out = s
            .datadb()
            .execute_read_blocking(&result.new_worldline_id, "SELECT x FROM t", 10, None)
            .unwrap();
        assert_eq!(out.rows[0][0], json!(9));
    }

    #[test]
    fn historical_fork_uses_nearest_snapshot() {
        let (_tmp, s) = store();
        let thread = s.create_thread(None).unwrap();
        let wid = s.create_worldline(&thread.id, None).unwrap().id;

        let first = s
            .append_event(&wid, EventType::UserMessage, &json!({"text": "one"}))
            .unwrap();

        // Snapshot the DB as of `first`, with marker data.
        let (conn, _) = s.datadb().open(&wid, false, None).unwrap();
        conn.execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1);")
            .unwrap();
        drop(conn);
        s.create_snapshot(&wid, &first.id).unwrap();

        // Mutate the live DB afterwards.
        let (conn, _) = s.datadb().open(&wid, false, None).unwrap();
        conn.execute_batch("INSERT INTO t VALUES (2);").unwrap();
        drop(conn);
        s.append_event(&wid, EventType::AssistantMessage, &json!({"text": "two"}))
            .unwrap();

        // Fork from the historical event: the branch sees snapshot state.
        let result = s
            .branch_from_event(&BranchOptions {
                source_worldline_id: wid,
                from_event_id: first.id,
                name: None,
                append_events: false,
                carried_user_message: None,
            })
            .unwrap();

        let out = s
            .datadb()
            .execute_read_blocking(&result.new_worldline_id, "SELECT COUNT(*) FROM t", 10, None)
            .unwrap();
        assert_eq!(out.rows[0][0], json!(1));
    }
}
