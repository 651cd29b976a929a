//! The event model: immutable, append-only records that make up a
//! worldline's timeline.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMessage,
    AssistantPlan,
    AssistantMessage,
    ToolCallSql,
    ToolResultSql,
    ToolCallPython,
    ToolResultPython,
    ToolCallSubagents,
    ToolResultSubagents,
    TimeTravel,
    WorldlineCreated,
    CsvImport,
    ExternalDbAttached,
    ExternalDbDetached,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AssistantPlan => "assistant_plan",
            Self::AssistantMessage => "assistant_message",
            Self::ToolCallSql => "tool_call_sql",
            Self::ToolResultSql => "tool_result_sql",
            Self::ToolCallPython => "tool_call_python",
            Self::ToolResultPython => "tool_result_python",
            Self::ToolCallSubagents => "tool_call_subagents",
            Self::ToolResultSubagents => "tool_result_subagents",
            Self::TimeTravel => "time_travel",
            Self::WorldlineCreated => "worldline_created",
            Self::CsvImport => "csv_import",
            Self::ExternalDbAttached => "external_db_attached",
            Self::ExternalDbDetached => "external_db_detached",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }

    /// Tool-result events whose parent must be the matching tool call.
    pub fn is_tool_result(self) -> bool {
        matches!(
            self,
            Self::ToolResultSql | Self::ToolResultPython | Self::ToolResultSubagents
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An immutable record on a worldline. Never mutated after insertion;
/// `parent_event_id` links the chain back to the fork point (or to the
/// first event, whose parent is `None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub worldline_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl EventRecord {
    /// The `text` field of a message payload, when present and non-empty.
    pub fn text(&self) -> Option<&str> {
        match self.payload.get("text") {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether a tool-result payload carries an `error` field.
    pub fn has_error(&self) -> bool {
        matches!(self.payload.get("error"), Some(v) if !v.is_null())
    }
}

/// The last `assistant_message` text on a chronological event slice.
pub fn last_assistant_text(events: &[EventRecord]) -> Option<&str> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::AssistantMessage)
        .and_then(|e| e.text())
}

/// The last `assistant_message` payload on a chronological event slice.
pub fn last_assistant_payload(events: &[EventRecord]) -> Option<&serde_json::Value> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::AssistantMessage)
        .map(|e| &e.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType, payload: serde_json::Value) -> EventRecord {
        EventRecord {
            id: "event_1".into(),
            worldline_id: "worldline_1".into(),
            parent_event_id: None,
            event_type,
            payload,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn type_round_trips_through_snake_case() {
        for raw in [
            "user_message",
            "tool_call_sql",
            "tool_result_subagents",
            "worldline_created",
            "external_db_detached",
        ] {
            let parsed = EventType::parse(raw).unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!(EventType::parse("nope").is_none());
    }

    #[test]
    fn text_skips_blank_payloads() {
        assert_eq!(
            event(EventType::UserMessage, json!({"text": "hi"})).text(),
            Some("hi")
        );
        assert_eq!(event(EventType::UserMessage, json!({"text": "  "})).text(), None);
        assert_eq!(event(EventType::UserMessage, json!({})).text(), None);
    }

    #[test]
    fn last_assistant_text_scans_backwards() {
        let events = vec![
            event(EventType::AssistantMessage, json!({"text": "first"})),
            event(EventType::UserMessage, json!({"text": "question"})),
            event(EventType::AssistantMessage, json!({"text": "second"})),
        ];
        assert_eq!(last_assistant_text(&events), Some("second"));
        assert_eq!(last_assistant_text(&[]), None);
    }

    #[test]
    fn has_error_ignores_null() {
        assert!(event(EventType::ToolResultSql, json!({"error": "boom"})).has_error());
        assert!(!event(EventType::ToolResultSql, json!({"error": null})).has_error());
        assert!(!event(EventType::ToolResultSql, json!({"rows": []})).has_error());
    }
}
