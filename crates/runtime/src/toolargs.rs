//! Tool-argument normalization.
//!
//! LLM arguments arrive as untyped maps with field aliasing
//! (`query|statement → sql`, `python|script|input → code`), occasional
//! double-encoded JSON payloads, and half-streamed `_raw` fragments.
//! Everything is repaired here, then converted into the typed
//! [`NormalizedCall`] the dispatcher routes on; clamping lives here too.

use serde_json::{Map, Value};
use wl_domain::{Error, Result};

pub const TOOL_RUN_SQL: &str = "run_sql";
pub const TOOL_RUN_PYTHON: &str = "run_python";
pub const TOOL_TIME_TRAVEL: &str = "time_travel";
pub const TOOL_SPAWN_SUBAGENTS: &str = "spawn_subagents";

pub const DEFAULT_SQL_LIMIT: usize = 100;
pub const DEFAULT_PYTHON_TIMEOUT: u64 = 30;
pub const DEFAULT_SUBAGENT_TIMEOUT_S: u64 = 300;
pub const DEFAULT_SUBAGENT_MAX_ITERATIONS: u32 = 8;
pub const DEFAULT_MAX_SUBAGENTS: usize = 8;
pub const DEFAULT_MAX_PARALLEL_SUBAGENTS: usize = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SpawnArgs {
    pub goal: Option<String>,
    pub tasks: Option<Vec<Value>>,
    pub from_event_id: Option<String>,
    pub timeout_s: u64,
    pub max_iterations: u32,
    pub max_subagents: usize,
    pub max_parallel_subagents: usize,
}

#[derive(Debug, Clone)]
pub enum NormalizedCall {
    Sql { sql: String, limit: usize },
    Python { code: String, timeout: u64 },
    TimeTravel {
        from_event_id: String,
        name: Option<String>,
    },
    SpawnSubagents(SpawnArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn extract_text_field(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

fn strip_markdown_code_fence(value: &str) -> String {
    let stripped = value.trim();
    if !stripped.starts_with("```") {
        return value.to_string();
    }

    let mut lines: Vec<&str> = stripped.lines().collect();
    if lines.first().map(|l| l.starts_with("```")).unwrap_or(false) {
        lines.remove(0);
    }
    if lines.last().map(|l| l.trim().starts_with("```")).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// If a `code`/`sql` field is itself a JSON object string
/// (`'{"code":"print(1)","timeout":30}'`), pull the real payload out.
fn unwrap_embedded_payload(value: &str, field: &str) -> String {
    let candidate = strip_markdown_code_fence(value);
    let candidate = candidate.trim();
    if !candidate.starts_with('{') {
        return candidate.to_string();
    }

    let parsed: Value = match serde_json::from_str(candidate) {
        Ok(parsed) => parsed,
        Err(_) => return candidate.to_string(),
    };
    let map = match parsed.as_object() {
        Some(map) => map,
        None => return candidate.to_string(),
    };

    if let Some(direct) = extract_text_field(map.get(field)) {
        return direct;
    }

    let aliases: &[&str] = match field {
        "code" => &["python", "script", "input", "query"],
        "sql" => &["query", "statement"],
        _ => &[],
    };
    for alias in aliases {
        if let Some(value) = extract_text_field(map.get(*alias)) {
            return value;
        }
    }

    candidate.to_string()
}

/// Coerce an integer-ish value (number or numeric string), clamped.
fn coerce_int(value: Option<&Value>, default: i64, minimum: i64, maximum: i64) -> i64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .unwrap_or(default);
    parsed.clamp(minimum, maximum)
}

fn maybe_extract_nested_arguments(raw: &str) -> Option<Map<String, Value>> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    let map = parsed.as_object()?;

    match map.get("arguments") {
        Some(Value::Object(nested)) => Some(nested.clone()),
        Some(Value::String(nested_raw)) => {
            let nested: Value = serde_json::from_str(nested_raw).ok()?;
            nested.as_object().cloned()
        }
        _ => Some(map.clone()),
    }
}

/// Mine a `"code":"…"` / `"sql":"…"` string literal out of a raw (and
/// possibly truncated) arguments fragment.
fn rescue_field_from_raw(raw: &str, field: &str) -> Option<String> {
    let pattern = format!(r#""{field}"\s*:\s*"((?:[^"\\]|\\.)*)""#);
    let regex = regex::Regex::new(&pattern).ok()?;
    let captured = regex.captures(raw)?.get(1)?.as_str().to_string();
    let decoded: String = serde_json::from_str(&format!("\"{captured}\"")).ok()?;
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| decoded)
}

fn apply_clamps(tool_name: &str, map: &mut Map<String, Value>) {
    match tool_name {
        TOOL_RUN_SQL => {
            let limit = coerce_int(map.get("limit"), DEFAULT_SQL_LIMIT as i64, 1, 10_000);
            map.insert("limit".into(), Value::from(limit));
        }
        TOOL_RUN_PYTHON => {
            let timeout = coerce_int(map.get("timeout"), DEFAULT_PYTHON_TIMEOUT as i64, 1, 120);
            map.insert("timeout".into(), Value::from(timeout));
        }
        TOOL_SPAWN_SUBAGENTS => {
            let timeout_s = coerce_int(
                map.get("timeout_s"),
                DEFAULT_SUBAGENT_TIMEOUT_S as i64,
                1,
                1800,
            );
            map.insert("timeout_s".into(), Value::from(timeout_s));
            let max_iterations = coerce_int(
                map.get("max_iterations"),
                DEFAULT_SUBAGENT_MAX_ITERATIONS as i64,
                1,
                100,
            );
            map.insert("max_iterations".into(), Value::from(max_iterations));
            let max_subagents = coerce_int(map.get("max_subagents"), DEFAULT_MAX_SUBAGENTS as i64, 1, 50);
            map.insert("max_subagents".into(), Value::from(max_subagents));
            let max_parallel = coerce_int(
                map.get("max_parallel_subagents"),
                DEFAULT_MAX_PARALLEL_SUBAGENTS as i64,
                1,
                10,
            );
            map.insert("max_parallel_subagents".into(), Value::from(max_parallel));
        }
        _ => {}
    }
}

/// Repair and normalize raw tool arguments into a canonical map.
pub fn normalize_arguments(tool_name: &str, arguments: &Value) -> Map<String, Value> {
    let tool_name = tool_name.trim();
    let mut result: Map<String, Value> = arguments.as_object().cloned().unwrap_or_default();

    if tool_name == TOOL_RUN_SQL {
        let sql = extract_text_field(result.get("sql"))
            .or_else(|| extract_text_field(result.get("query")))
            .or_else(|| extract_text_field(result.get("statement")));
        if let Some(sql) = sql {
            result.insert("sql".into(), Value::String(unwrap_embedded_payload(&sql, "sql")));
        }
    }

    if tool_name == TOOL_RUN_PYTHON {
        let code = extract_text_field(result.get("code"))
            .or_else(|| extract_text_field(result.get("python")))
            .or_else(|| extract_text_field(result.get("script")))
            .or_else(|| extract_text_field(result.get("input")))
            .or_else(|| extract_text_field(result.get("query")));
        if let Some(code) = code {
            result.insert("code".into(), Value::String(unwrap_embedded_payload(&code, "code")));
        }
    }

    // Rescue from half-streamed `_raw` fragments.
    if let Some(raw) = extract_text_field(result.get("_raw")) {
        if let Some(nested) = maybe_extract_nested_arguments(&raw) {
            let mut merged: Map<String, Value> = nested
                .into_iter()
                .filter(|(key, _)| key != "_raw")
                .collect();
            for (key, value) in result.iter() {
                if key != "_raw" {
                    merged.insert(key.clone(), value.clone());
                }
            }
            result = merged;
        }

        let code_field = if tool_name == TOOL_RUN_SQL { "sql" } else { "code" };
        if !result.contains_key(code_field) {
            if let Some(rescued) = rescue_field_from_raw(&raw, code_field) {
                result.insert(code_field.into(), Value::String(rescued));
            }
        }
    }

    // Drop non-string payload fields that survived merging.
    if tool_name == TOOL_RUN_SQL && !matches!(result.get("sql"), Some(Value::String(_))) {
        result.remove("sql");
    }
    if tool_name == TOOL_RUN_PYTHON && !matches!(result.get("code"), Some(Value::String(_))) {
        result.remove("code");
    }

    // Unwrap once more: a merged `_raw` payload can reintroduce an
    // embedded-JSON field.
    if tool_name == TOOL_RUN_SQL {
        if let Some(sql) = extract_text_field(result.get("sql")) {
            result.insert("sql".into(), Value::String(unwrap_embedded_payload(&sql, "sql")));
        }
    }
    if tool_name == TOOL_RUN_PYTHON {
        if let Some(code) = extract_text_field(result.get("code")) {
            result.insert("code".into(), Value::String(unwrap_embedded_payload(&code, "code")));
        }
    }

    result.remove("_raw");
    apply_clamps(tool_name, &mut result);
    result
}

/// Canonical per-turn dedup signature. serde_json orders object keys,
/// so equal argument maps stringify identically.
pub fn canonical_signature(worldline_id: &str, tool_name: &str, arguments: &Map<String, Value>) -> String {
    serde_json::json!({
        "worldline_id": worldline_id,
        "name": tool_name,
        "arguments": arguments,
    })
    .to_string()
}

/// Convert a normalized map into the typed call the dispatcher routes
/// on. Missing required fields surface as `BadRequest`.
pub fn typed_call(tool_name: &str, arguments: &Map<String, Value>) -> Result<NormalizedCall> {
    match tool_name.trim() {
        TOOL_RUN_SQL => {
            let sql = extract_text_field(arguments.get("sql")).ok_or_else(|| {
                Error::bad_request("run_sql requires a non-empty 'sql' string")
            })?;
            let limit = coerce_int(arguments.get("limit"), DEFAULT_SQL_LIMIT as i64, 1, 10_000);
            Ok(NormalizedCall::Sql {
                sql,
                limit: limit as usize,
            })
        }
        TOOL_RUN_PYTHON => {
            let code = extract_text_field(arguments.get("code")).ok_or_else(|| {
                Error::bad_request("run_python requires a non-empty 'code' string")
            })?;
            let timeout = coerce_int(arguments.get("timeout"), DEFAULT_PYTHON_TIMEOUT as i64, 1, 120);
            Ok(NormalizedCall::Python {
                code,
                timeout: timeout as u64,
            })
        }
        TOOL_TIME_TRAVEL => {
            let from_event_id = extract_text_field(arguments.get("from_event_id"))
                .ok_or_else(|| Error::bad_request("time_travel requires 'from_event_id'"))?;
            Ok(NormalizedCall::TimeTravel {
                from_event_id,
                name: extract_text_field(arguments.get("name")),
            })
        }
        TOOL_SPAWN_SUBAGENTS => {
            let tasks = arguments
                .get("tasks")
                .and_then(|v| v.as_array())
                .filter(|tasks| !tasks.is_empty())
                .cloned();
            let goal = extract_text_field(arguments.get("goal"));
            if tasks.is_none() && goal.is_none() {
                return Err(Error::bad_request(
                    "spawn_subagents requires non-empty 'goal' or 'tasks'",
                ));
            }
            Ok(NormalizedCall::SpawnSubagents(SpawnArgs {
                goal,
                tasks,
                from_event_id: extract_text_field(arguments.get("from_event_id")),
                timeout_s: coerce_int(
                    arguments.get("timeout_s"),
                    DEFAULT_SUBAGENT_TIMEOUT_S as i64,
                    1,
                    1800,
                ) as u64,
                max_iterations: coerce_int(
                    arguments.get("max_iterations"),
                    DEFAULT_SUBAGENT_MAX_ITERATIONS as i64,
                    1,
                    100,
                ) as u32,
                max_subagents: coerce_int(arguments.get("max_subagents"), DEFAULT_MAX_SUBAGENTS as i64, 1, 50)
                    as usize,
                max_parallel_subagents: coerce_int(
                    arguments.get("max_parallel_subagents"),
                    DEFAULT_MAX_PARALLEL_SUBAGENTS as i64,
                    1,
                    10,
                ) as usize,
            }))
        }
        other => Err(Error::bad_request(format!("unknown tool '{other}'"))),
    }
}
