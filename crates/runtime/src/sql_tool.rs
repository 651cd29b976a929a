//! The `run_sql` tool: read-only validation, call/result event
//! persistence, query execution against the worldline's analytical DB.

use std::time::Instant;

use serde_json::Value;
use wl_domain::event::EventType;
use wl_domain::{Error, Result};
use wl_store::MetaStore;

use crate::signals::TurnSignals;

pub const READ_ONLY_PREFIXES: &[&str] = &["select", "with", "show", "describe", "explain"];

#[derive(Debug, Clone)]
pub struct SqlToolRequest {
    pub worldline_id: String,
    pub sql: String,
    pub limit: usize,
    pub allowed_external_aliases: Option<Vec<String>>,
    pub call_id: Option<String>,
}

/// Reject anything that is not a single read-only statement. Leading
/// parens are permitted; a non-terminal `;` is not.
pub fn validate_read_only_sql(sql: &str) -> Result<()> {
    let stripped = sql.trim().trim_start_matches('(');
    let first = stripped
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    if !READ_ONLY_PREFIXES.contains(&first.as_str()) {
        return Err(Error::bad_request("Only read-only SQL is allowed."));
    }
    if stripped.trim_end_matches(';').contains(';') {
        return Err(Error::bad_request("Multiple SQL statements are not allowed."));
    }
    Ok(())
}

/// Execute the SQL tool. Query failures are reified into the persisted
/// `tool_result_sql` payload and returned as an `error`-carrying value;
/// only validation and store failures surface as `Err`.
pub async fn execute_sql_tool(
    store: &MetaStore,
    req: &SqlToolRequest,
    signals: &TurnSignals,
) -> Result<Value> {
    validate_read_only_sql(&req.sql)?;
    store.worldline(&req.worldline_id)?;
    let started = Instant::now();

    let mut call_payload = serde_json::json!({
        "sql": req.sql,
        "limit": req.limit,
    });
    if let Some(aliases) = &req.allowed_external_aliases {
        let normalized: Vec<String> = aliases
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        call_payload["allowed_external_aliases"] = Value::from(normalized);
    }
    if let Some(call_id) = &req.call_id {
        call_payload["call_id"] = Value::from(call_id.clone());
    }

    let call_event = store.append_event(&req.worldline_id, EventType::ToolCallSql, &call_payload)?;
    signals.emit_event(&req.worldline_id, &call_event).await;

    let result_payload = match store
        .datadb()
        .execute_read(
            &req.worldline_id,
            &req.sql,
            req.limit,
            req.allowed_external_aliases.clone(),
        )
        .await
    {
        Ok(result) => result.to_payload(started.elapsed().as_millis() as u64),
        Err(err) => {
            tracing::debug!(worldline_id = %req.worldline_id, error = %err, "sql query failed");
            serde_json::json!({"error": err.to_string()})
        }
    };

    let result_event = store.append_and_advance(
        &req.worldline_id,
        Some(&call_event.id),
        EventType::ToolResultSql,
        &result_payload,
    )?;
    signals.emit_event(&req.worldline_id, &result_event).await;

    Ok(result_payload)
}
