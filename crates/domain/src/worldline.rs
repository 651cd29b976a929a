//! Threads, worldlines, branching options, artifacts, and snapshots.

use serde::{Deserialize, Serialize};

/// A top-level conversation. Owns many worldlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRow {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
}

/// A single linear conversation timeline within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldlineRow {
    pub id: String,
    pub thread_id: String,
    pub parent_worldline_id: Option<String>,
    pub forked_from_event_id: Option<String>,
    pub head_event_id: Option<String>,
    pub name: String,
    pub created_at: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Branching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct BranchOptions {
    pub source_worldline_id: String,
    pub from_event_id: String,
    pub name: Option<String>,
    /// When set, a three-event prologue (`worldline_created`,
    /// `time_travel`, `user_message`) is chained from the fork point.
    pub append_events: bool,
    pub carried_user_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchResult {
    pub new_worldline_id: String,
    pub thread_id: String,
    pub source_worldline_id: String,
    pub from_event_id: String,
    pub name: String,
    pub created_event_ids: Vec<String>,
    /// Whether the caller should rebind to the new worldline.
    pub switched: bool,
}

impl BranchResult {
    pub fn to_tool_result(&self) -> serde_json::Value {
        serde_json::json!({
            "new_worldline_id": self.new_worldline_id,
            "thread_id": self.thread_id,
            "source_worldline_id": self.source_worldline_id,
            "from_event_id": self.from_event_id,
            "name": self.name,
            "created_event_ids": self.created_event_ids,
            "switched": self.switched,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifacts & snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A file produced inside a sandbox execution, owned by its producing
/// `tool_result_python` (or fan-in result) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub worldline_id: String,
    pub event_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub name: String,
    pub path: String,
    pub created_at: String,
}

/// A point-in-time copy of a worldline's analytical DB, keyed by
/// `(worldline_id, event_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub worldline_id: String,
    pub event_id: String,
    pub db_path: String,
    pub created_at: String,
}
