//! Prompt reconstruction from the event log.
//!
//! User/assistant messages pass through verbatim; tool calls are folded
//! into an assistant message carrying the provider wire shape, and tool
//! results become tool messages linked by call id. Large payloads are
//! truncated — the model sees a bounded view, the log keeps everything.

use serde_json::Value;
use wl_domain::event::{EventRecord, EventType};
use wl_domain::tool::ChatMessage;

pub const SYSTEM_PROMPT: &str = "You are an AI assistant with access to tools for data analysis.\n\n\
1. **run_sql**: Execute a read-only SQL query against the worldline's analytical database. Use it for table reads, filters, and aggregations.\n\
2. **run_python**: Execute Python in the sandboxed workspace. Use it for plotting, data manipulation, and file artifacts. For plots, call plt.savefig('artifacts/plot.png'); saved files become viewable artifacts.\n\
3. **time_travel**: Create a new worldline from a prior event and continue there.\n\
4. **spawn_subagents**: Fan out parallel child investigations and block for their aggregated results.\n\n\
**CRITICAL - You MUST execute tools:**\n\
- Never respond with only a plan. Call run_sql and/or run_python, then summarize the results.\n\
- To explore a schema, run a query like \"SELECT * FROM table LIMIT 5\".\n\n\
**Guidelines:**\n\
- Call SQL first to retrieve data, then Python to visualize or analyze further.\n\
- Never write Python that calls backend tools such as run_sql(), run_python(), or time_travel(); tools are invoked at the model level only.\n\
- In Python, use LATEST_SQL_RESULT (dict) and LATEST_SQL_DF (pandas DataFrame, when available), auto-injected from the latest successful SQL result.\n\
- Do not invent dataset rows in Python. If more fields are needed, call run_sql again.";

const TOOL_RESULT_MAX_CHARS: usize = 2_000;

fn truncate_payload(payload: &Value) -> String {
    let serialized = payload.to_string();
    if serialized.chars().count() > TOOL_RESULT_MAX_CHARS {
        let cut: String = serialized.chars().take(TOOL_RESULT_MAX_CHARS).collect();
        format!("{cut}...(truncated)")
    } else {
        serialized
    }
}

fn tool_name_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::ToolCallSql => "run_sql",
        EventType::ToolCallPython => "run_python",
        EventType::ToolCallSubagents => "spawn_subagents",
        _ => "tool",
    }
}

struct PendingCall {
    call_id: String,
    name: &'static str,
    arguments: Value,
}

fn flush_pending(
    messages: &mut Vec<ChatMessage>,
    plan: &Option<String>,
    pending: &[PendingCall],
) {
    let specs: Vec<Value> = pending
        .iter()
        .map(|call| {
            serde_json::json!({
                "id": call.call_id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_string(),
                },
            })
        })
        .collect();
    messages.push(ChatMessage::assistant_with_tool_calls(
        plan.clone().unwrap_or_default(),
        specs,
    ));
}

/// Rebuild the LLM conversation from a chronological event slice.
pub fn build_llm_messages(events: &[EventRecord]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];

    let mut pending_plan: Option<String> = None;
    let mut pending_calls: Vec<PendingCall> = Vec::new();
    let mut emitted_for_turn = false;

    for event in events {
        match event.event_type {
            EventType::UserMessage => {
                pending_plan = None;
                pending_calls.clear();
                emitted_for_turn = false;
                if let Some(text) = event.text() {
                    messages.push(ChatMessage::user(text));
                }
            }
            EventType::AssistantPlan => {
                pending_plan = event.text().map(str::to_string);
                pending_calls.clear();
                emitted_for_turn = false;
            }
            EventType::AssistantMessage => {
                if !pending_calls.is_empty() && !emitted_for_turn {
                    flush_pending(&mut messages, &pending_plan, &pending_calls);
                }
                pending_plan = None;
                pending_calls.clear();
                emitted_for_turn = false;
                if let Some(text) = event.text() {
                    messages.push(ChatMessage::assistant(text));
                }
            }
            EventType::ToolCallSql | EventType::ToolCallPython | EventType::ToolCallSubagents => {
                if emitted_for_turn {
                    pending_calls.clear();
                    pending_plan = None;
                    emitted_for_turn = false;
                }
                let mut arguments = event.payload.clone();
                if let Some(map) = arguments.as_object_mut() {
                    map.remove("call_id");
                }
                let call_id = event
                    .payload
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(&event.id)
                    .to_string();
                pending_calls.push(PendingCall {
                    call_id,
                    name: tool_name_for(event.event_type),
                    arguments,
                });
            }
            EventType::ToolResultSql | EventType::ToolResultPython | EventType::ToolResultSubagents => {
                if !pending_calls.is_empty() && !emitted_for_turn {
                    flush_pending(&mut messages, &pending_plan, &pending_calls);
                    emitted_for_turn = true;
                }
                let call_id = event
                    .parent_event_id
                    .as_ref()
                    .and_then(|parent| resolve_call_id(events, parent));
                messages.push(ChatMessage::tool_result(call_id, truncate_payload(&event.payload)));
            }
            // Branch bookkeeping and data imports carry no prompt text.
            EventType::TimeTravel
            | EventType::WorldlineCreated
            | EventType::CsvImport
            | EventType::ExternalDbAttached
            | EventType::ExternalDbDetached => {}
        }
    }

    messages
}

/// The call id of a `tool_call_*` event: its payload `call_id`, falling
/// back to the event id.
fn resolve_call_id(events: &[EventRecord], call_event_id: &str) -> Option<String> {
    let call_event = events.iter().find(|e| e.id == call_event_id)?;
    let from_payload = call_event
        .payload
        .get("call_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    Some(from_payload.unwrap_or(&call_event.id).to_string())
}
