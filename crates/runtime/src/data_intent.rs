//! The SQL-to-Python data checkpoint memory message.
//!
//! Summarizes the most recent successful SQL result (row counts, column
//! roles, time columns, a short SQL preview) so follow-up steps reuse
//! `LATEST_SQL_RESULT` / `LATEST_SQL_DF` instead of refetching.

use serde::Serialize;
use serde_json::Value;
use wl_domain::event::{EventRecord, EventType};
use wl_domain::tool::ChatMessage;

pub const DATA_INTENT_HEADER: &str = "SQL-to-Python data checkpoint";

const MAX_COLUMNS: usize = 24;
const MAX_ROLE_COLUMNS: usize = 16;
const MAX_TIME_COLUMNS: usize = 8;
const SQL_PREVIEW_CHARS: usize = 220;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataIntentSummary {
    pub source: &'static str,
    pub row_count: usize,
    pub preview_count: usize,
    pub columns: Vec<String>,
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    pub time_columns: Vec<String>,
    pub sql_preview: String,
}

fn is_numeric_sql_type(type_name: &str) -> bool {
    let lowered = type_name.trim().to_lowercase();
    ["int", "decimal", "double", "float", "real", "numeric", "hugeint"]
        .iter()
        .any(|token| lowered.contains(token))
}

fn looks_like_time_column(name: &str) -> bool {
    let lowered = name.to_lowercase();
    ["date", "time", "month", "year", "day", "week", "quarter"]
        .iter()
        .any(|token| lowered.contains(token))
}

/// Build the checkpoint from a successful `tool_result_sql` payload and
/// the SQL that produced it.
pub fn build_summary(sql: Option<&str>, sql_result: &Value) -> Option<DataIntentSummary> {
    let result = sql_result.as_object()?;
    if matches!(result.get("error"), Some(v) if !v.is_null()) {
        return None;
    }

    let mut columns = Vec::new();
    let mut dimensions = Vec::new();
    let mut measures = Vec::new();
    if let Some(meta) = result.get("columns").and_then(Value::as_array) {
        for column in meta {
            let name = column
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if name.is_empty() {
                continue;
            }
            columns.push(name.to_string());
            let column_type = column.get("type").and_then(Value::as_str).unwrap_or("");
            if is_numeric_sql_type(column_type) {
                measures.push(name.to_string());
            } else {
                dimensions.push(name.to_string());
            }
        }
    }

    let row_len = result.get("rows").and_then(Value::as_array).map(Vec::len);
    let row_count = result
        .get("row_count")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .or(row_len)
        .unwrap_or(0);
    let preview_count = result
        .get("preview_count")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .or(row_len)
        .unwrap_or(0);

    let time_columns: Vec<String> = columns
        .iter()
        .filter(|name| looks_like_time_column(name))
        .take(MAX_TIME_COLUMNS)
        .cloned()
        .collect();

    let sql_preview = sql
        .map(|raw| {
            let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.chars().count() > SQL_PREVIEW_CHARS {
                let cut: String = collapsed.chars().take(SQL_PREVIEW_CHARS).collect();
                format!("{cut}...")
            } else {
                collapsed
            }
        })
        .unwrap_or_default();

    columns.truncate(MAX_COLUMNS);
    dimensions.truncate(MAX_ROLE_COLUMNS);
    measures.truncate(MAX_ROLE_COLUMNS);

    Some(DataIntentSummary {
        source: "latest_successful_sql",
        row_count,
        preview_count,
        columns,
        dimensions,
        measures,
        time_columns,
        sql_preview,
    })
}

/// Find the latest successful SQL result on the event slice and build
/// the checkpoint from it.
pub fn summary_from_events(events: &[EventRecord]) -> Option<DataIntentSummary> {
    for event in events.iter().rev() {
        if event.event_type != EventType::ToolResultSql || event.has_error() {
            continue;
        }
        let sql = event
            .parent_event_id
            .as_ref()
            .and_then(|parent_id| events.iter().find(|e| e.id == *parent_id))
            .and_then(|parent| parent.payload.get("sql"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        return build_summary(sql.as_deref(), &event.payload);
    }
    None
}

fn render(summary: &DataIntentSummary) -> String {
    let payload = serde_json::json!({
        "data_intent": summary,
        "instructions": "Use this checkpoint when planning follow-up SQL/Python steps. If Python is needed, reference LATEST_SQL_RESULT/LATEST_SQL_DF instead of refetching identical data.",
    });
    format!("{DATA_INTENT_HEADER} (always-on memory):\n{payload}")
}

/// Insert, replace, or remove the checkpoint message. It sits after the
/// artifact inventory (index 2) when the prompt is long enough.
pub fn upsert_data_intent_message(messages: &mut Vec<ChatMessage>, summary: Option<&DataIntentSummary>) {
    let existing = messages.iter().position(|m| {
        m.role == wl_domain::tool::Role::System && m.content.starts_with(DATA_INTENT_HEADER)
    });

    let summary = match summary {
        Some(summary) => summary,
        None => {
            if let Some(index) = existing {
                messages.remove(index);
            }
            return;
        }
    };

    let memory = ChatMessage::system(render(summary));
    match existing {
        Some(index) => messages[index] = memory,
        None => {
            let index = if messages.len() >= 2 { 2 } else { messages.len() };
            messages.insert(index, memory);
        }
    }
}
