//! The append-only event log and the optimistic head-advance primitive.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use wl_domain::event::{EventRecord, EventType};
use wl_domain::id::new_id;
use wl_domain::{Error, Result};

use crate::MetaStore;

/// Bounded retries for appends that have no semantic parent requirement.
pub const APPEND_MAX_ATTEMPTS: usize = 4;

impl MetaStore {
    // ── Reads ─────────────────────────────────────────────────────────

    pub fn event(&self, event_id: &str) -> Result<EventRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, worldline_id, parent_event_id, type, payload_json, created_at
             FROM events WHERE id = ?1",
            rusqlite::params![event_id],
            row_to_event,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("event {event_id}")))
    }

    /// Monotonic local order key: the highest `rowid` among the
    /// worldline's events (0 when empty).
    pub fn max_rowid(&self, worldline_id: &str) -> Result<i64> {
        self.worldline(worldline_id)?;
        let conn = self.conn.lock();
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(rowid), 0) FROM events WHERE worldline_id = ?1",
            rusqlite::params![worldline_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Events appended to the worldline after `rowid`, in insertion order.
    pub fn events_since_rowid(&self, worldline_id: &str, rowid: i64) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, worldline_id, parent_event_id, type, payload_json, created_at
             FROM events
             WHERE worldline_id = ?1 AND rowid > ?2
             ORDER BY rowid ASC",
        )?;
        let events = stmt
            .query_map(rusqlite::params![worldline_id, rowid], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Walk `parent_event_id` from the worldline's current head, returning
    /// events oldest-first. The walk crosses fork points into ancestor
    /// worldlines, which is exactly what prompt rebuilding wants.
    pub fn rebuild_history(&self, worldline_id: &str) -> Result<Arc<Vec<EventRecord>>> {
        let worldline = self.worldline(worldline_id)?;
        let head = match worldline.head_event_id {
            Some(head) => head,
            None => return Ok(Arc::new(Vec::new())),
        };
        self.history_from(worldline_id, &head)
    }

    /// History ending at an explicit head event, cached per
    /// `(worldline, head)`.
    pub fn history_from(&self, worldline_id: &str, head_event_id: &str) -> Result<Arc<Vec<EventRecord>>> {
        if let Some(cached) = self.cached_history(worldline_id, head_event_id) {
            return Ok(cached);
        }

        let mut chain = Vec::new();
        let mut cursor = Some(head_event_id.to_string());
        while let Some(event_id) = cursor {
            let event = self.event(&event_id)?;
            cursor = event.parent_event_id.clone();
            chain.push(event);
        }
        chain.reverse();

        let chain = Arc::new(chain);
        self.cache_history(worldline_id, head_event_id, chain.clone());
        Ok(chain)
    }

    /// Whether `needle` is reachable from `head` through the
    /// `parent_event_id` chain (inclusive).
    pub fn event_in_history(&self, head_event_id: &str, needle: &str) -> Result<bool> {
        let mut cursor = Some(head_event_id.to_string());
        while let Some(event_id) = cursor {
            if event_id == needle {
                return Ok(true);
            }
            match self.event(&event_id) {
                Ok(event) => cursor = event.parent_event_id,
                Err(Error::NotFound(_)) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    pub fn event_exists(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM events WHERE id = ?1 LIMIT 1",
                rusqlite::params![event_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Writes ────────────────────────────────────────────────────────

    /// Atomically verify the worldline head equals `expected_head`,
    /// insert the event with `parent_event_id = expected_head`, and move
    /// the head. Fails with [`Error::HeadConflict`] when the head differs
    /// — it never guesses.
    pub fn append_and_advance(
        &self,
        worldline_id: &str,
        expected_head: Option<&str>,
        event_type: EventType,
        payload: &serde_json::Value,
    ) -> Result<EventRecord> {
        let created_at = self.now();
        let event_id = new_id("event");

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let head: Option<String> = tx
                .query_row(
                    "SELECT head_event_id FROM worldlines WHERE id = ?1",
                    rusqlite::params![worldline_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::not_found(format!("worldline {worldline_id}")))?;

            if head.as_deref() != expected_head {
                return Err(Error::head_conflict(format!(
                    "worldline {worldline_id} head is {:?}, expected {:?}",
                    head, expected_head
                )));
            }

            tx.execute(
                "INSERT INTO events (id, worldline_id, parent_event_id, type, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event_id,
                    worldline_id,
                    expected_head,
                    event_type.as_str(),
                    serde_json::to_string(payload)?,
                    created_at,
                ],
            )?;
            tx.execute(
                "UPDATE worldlines SET head_event_id = ?1 WHERE id = ?2",
                rusqlite::params![event_id, worldline_id],
            )?;
            tx.commit()?;
        }

        Ok(EventRecord {
            id: event_id,
            worldline_id: worldline_id.to_string(),
            parent_event_id: expected_head.map(str::to_string),
            event_type,
            payload: payload.clone(),
            created_at,
        })
    }

    /// Append without a semantic parent requirement: re-read the head and
    /// retry on conflict, up to [`APPEND_MAX_ATTEMPTS`] times. Used for
    /// user/assistant messages, where landing after newly-arrived events
    /// is acceptable.
    pub fn append_event(
        &self,
        worldline_id: &str,
        event_type: EventType,
        payload: &serde_json::Value,
    ) -> Result<EventRecord> {
        for attempt in 0..APPEND_MAX_ATTEMPTS {
            let head = self.worldline(worldline_id)?.head_event_id;
            match self.append_and_advance(worldline_id, head.as_deref(), event_type, payload) {
                Ok(event) => return Ok(event),
                Err(Error::HeadConflict(_)) if attempt + 1 < APPEND_MAX_ATTEMPTS => {
                    tracing::debug!(worldline_id, attempt, "head moved during append, rebasing");
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::head_conflict(format!(
            "worldline {worldline_id} head moved during {event_type} append"
        )))
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let raw_type: String = row.get(3)?;
    let payload_json: String = row.get(4)?;
    Ok(EventRecord {
        id: row.get(0)?,
        worldline_id: row.get(1)?,
        parent_event_id: row.get(2)?,
        event_type: EventType::parse(&raw_type).unwrap_or(EventType::AssistantMessage),
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::store;
    use serde_json::json;

    fn seeded_worldline(s: &MetaStore) -> String {
        let thread = s.create_thread(Some("t")).unwrap();
        s.create_worldline(&thread.id, Some("main")).unwrap().id
    }

    #[test]
    fn append_moves_head_and_links_parent() {
        let (_tmp, s) = store();
        let wid = seeded_worldline(&s);

        let first = s
            .append_and_advance(&wid, None, EventType::UserMessage, &json!({"text": "hi"}))
            .unwrap();
        assert_eq!(first.parent_event_id, None);
        assert_eq!(s.worldline(&wid).unwrap().head_event_id.as_deref(), Some(first.id.as_str()));

        let second = s
            .append_and_advance(
                &wid,
                Some(&first.id),
                EventType::AssistantMessage,
                &json!({"text": "hello"}),
            )
            .unwrap();
        assert_eq!(second.parent_event_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(
            s.worldline(&wid).unwrap().head_event_id.as_deref(),
            Some(second.id.as_str())
        );
    }

    #[test]
    fn stale_expected_head_conflicts_without_writing() {
        let (_tmp, s) = store();
        let wid = seeded_worldline(&s);

        let first = s
            .append_and_advance(&wid, None, EventType::UserMessage, &json!({"text": "a"}))
            .unwrap();

        // A second append that still claims the empty head must fail and
        // leave the log untouched.
        let err = s
            .append_and_advance(&wid, None, EventType::UserMessage, &json!({"text": "b"}))
            .unwrap_err();
        assert!(matches!(err, Error::HeadConflict(_)));
        assert_eq!(s.events_since_rowid(&wid, 0).unwrap().len(), 1);
        assert_eq!(
            s.worldline(&wid).unwrap().head_event_id.as_deref(),
            Some(first.id.as_str())
        );
    }

    #[test]
    fn append_event_rebases_onto_moved_head() {
        let (_tmp, s) = store();
        let wid = seeded_worldline(&s);

        s.append_event(&wid, EventType::UserMessage, &json!({"text": "one"}))
            .unwrap();
        let second = s
            .append_event(&wid, EventType::AssistantMessage, &json!({"text": "two"}))
            .unwrap();
        assert!(second.parent_event_id.is_some());

        let history = s.rebuild_history(&wid).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), Some("one"));
        assert_eq!(history[1].text(), Some("two"));
    }

    #[test]
    fn history_is_cached_per_head() {
        let (_tmp, s) = store();
        let wid = seeded_worldline(&s);
        let first = s
            .append_event(&wid, EventType::UserMessage, &json!({"text": "one"}))
            .unwrap();

        let a = s.rebuild_history(&wid).unwrap();
        let b = s.rebuild_history(&wid).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Appending moves the head; the rebuilt history reflects it.
        s.append_event(&wid, EventType::AssistantMessage, &json!({"text": "two"}))
            .unwrap();
        let c = s.rebuild_history(&wid).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].id, first.id);
    }

    #[test]
    fn ancestry_check_is_bounded_by_head() {
        let (_tmp, s) = store();
        let wid = seeded_worldline(&s);
        let first = s
            .append_event(&wid, EventType::UserMessage, &json!({"text": "one"}))
            .unwrap();
        let second = s
            .append_event(&wid, EventType::AssistantMessage, &json!({"text": "two"}))
            .unwrap();

        assert!(s.event_in_history(&second.id, &first.id).unwrap());
        assert!(s.event_in_history(&second.id, &second.id).unwrap());
        assert!(!s.event_in_history(&first.id, &second.id).unwrap());
        assert!(!s.event_in_history(&second.id, "event_missing").unwrap());
    }

    #[test]
    fn events_since_rowid_windows_a_turn() {
        let (_tmp, s) = store();
        let wid = seeded_worldline(&s);
        s.append_event(&wid, EventType::UserMessage, &json!({"text": "before"}))
            .unwrap();
        let mark = s.max_rowid(&wid).unwrap();
        s.append_event(&wid, EventType::AssistantMessage, &json!({"text": "after"}))
            .unwrap();

        let window = s.events_since_rowid(&wid, mark).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].text(), Some("after"));
    }

    #[test]
    fn concurrent_appends_race_to_exactly_one_winner() {
        let (_tmp, s) = store();
        let s = Arc::new(s);
        let wid = seeded_worldline(&s);
        let first = s
            .append_and_advance(&wid, None, EventType::UserMessage, &json!({"text": "base"}))
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..2 {
            let s = s.clone();
            let wid = wid.clone();
            let expected = first.id.clone();
            handles.push(std::thread::spawn(move || {
                s.append_and_advance(
                    &wid,
                    Some(&expected),
                    EventType::AssistantMessage,
                    &json!({"text": format!("writer {i}")}),
                )
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::HeadConflict(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 1);
        // Never two children of the same parent, never a lost write.
        assert_eq!(s.events_since_rowid(&wid, 0).unwrap().len(), 2);
    }

    #[test]
    fn unknown_worldline_is_not_found() {
        let (_tmp, s) = store();
        let err = s
            .append_and_advance("worldline_nope", None, EventType::UserMessage, &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
