//! Durable chat-turn job records.
//!
//! A job is the queued form of a turn: it survives process restart and
//! transitions `queued → running → {completed, failed, cancelled}`. Any
//! job found `running` at startup is reset to `queued` (at-least-once).

use serde::{Deserialize, Serialize};

use crate::tool::truncate_str;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The request half of a turn: the user message plus provider/model
/// routing hints and the tool-loop iteration cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    6
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            provider: None,
            model: None,
            max_iterations: default_max_iterations(),
        }
    }

    /// Clamp the iteration cap to the accepted `1..=100` range.
    pub fn clamped_max_iterations(&self) -> u32 {
        self.max_iterations.clamp(1, 100)
    }
}

/// Lineage fields linking a job to the fan-out that spawned it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobLineage {
    pub parent_job_id: Option<String>,
    pub fanout_group_id: Option<String>,
    pub task_label: Option<String>,
    pub parent_tool_call_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnJob {
    pub id: String,
    pub thread_id: String,
    pub worldline_id: String,
    pub request: TurnRequest,
    #[serde(flatten)]
    pub lineage: JobLineage,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// May differ from the input worldline after branching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_worldline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<JobSummary>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Number of queued jobs ahead of this one at enqueue time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
}

/// Completion summary: event count plus a preview of the final
/// assistant text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub event_count: usize,
    pub assistant_preview: String,
}

impl JobSummary {
    pub fn from_turn(events: &[crate::event::EventRecord]) -> Self {
        let preview = crate::event::last_assistant_text(events).unwrap_or("");
        Self {
            event_count: events.len(),
            assistant_preview: truncate_str(preview, 220),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventRecord, EventType};
    use serde_json::json;

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_parse_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn request_defaults_and_clamping() {
        let req: TurnRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(req.max_iterations, 6);

        let mut req = TurnRequest::new("hi");
        req.max_iterations = 0;
        assert_eq!(req.clamped_max_iterations(), 1);
        req.max_iterations = 500;
        assert_eq!(req.clamped_max_iterations(), 100);
    }

    #[test]
    fn summary_uses_last_assistant_message() {
        let events = vec![
            EventRecord {
                id: "event_a".into(),
                worldline_id: "worldline_w".into(),
                parent_event_id: None,
                event_type: EventType::UserMessage,
                payload: json!({"text": "question"}),
                created_at: String::new(),
            },
            EventRecord {
                id: "event_b".into(),
                worldline_id: "worldline_w".into(),
                parent_event_id: Some("event_a".into()),
                event_type: EventType::AssistantMessage,
                payload: json!({"text": "x".repeat(400)}),
                created_at: String::new(),
            },
        ];
        let summary = JobSummary::from_turn(&events);
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.assistant_preview.len(), 223);
    }
}
