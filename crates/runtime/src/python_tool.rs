//! The `run_python` tool: preflight checks, SQL-context and replay
//! prelude construction, sandbox handoff, artifact registration.

use std::time::Instant;

use serde_json::Value;
use wl_domain::event::{EventRecord, EventType};
use wl_domain::{Error, Result};
use wl_sandbox::SandboxManager;
use wl_store::MetaStore;

use crate::capacity::CapacityController;
use crate::signals::TurnSignals;

#[derive(Debug, Clone)]
pub struct PythonToolRequest {
    pub worldline_id: String,
    pub code: String,
    pub timeout: u64,
    pub call_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preflight
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const FORBIDDEN_TOOL_NAMES: &[&str] = &["run_sql", "run_python", "time_travel"];

fn detect_tool_invocations(code: &str) -> Vec<&'static str> {
    FORBIDDEN_TOOL_NAMES
        .iter()
        .filter(|name| {
            regex::Regex::new(&format!(r"\b{}\s*\(", name))
                .map(|re| re.is_match(code))
                .unwrap_or(false)
        })
        .copied()
        .collect()
}

/// A lightweight structural check standing in for a real Python
/// compile: balanced brackets outside strings/comments and terminated
/// string literals. Reports 1-based line/column of the offending token.
fn syntax_check(code: &str) -> Option<(String, usize, usize)> {
    let mut stack: Vec<(char, usize, usize)> = Vec::new();
    let mut line = 1usize;
    let mut col = 0usize;

    let chars: Vec<char> = code.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            col = 0;
            i += 1;
            continue;
        }
        col += 1;

        match c {
            '#' => {
                // Comment: skip to end of line.
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '\'' | '"' => {
                let quote = c;
                let (start_line, start_col) = (line, col);
                let triple = i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote;
                if triple {
                    i += 3;
                    col += 2;
                    let mut closed = false;
                    while i < chars.len() {
                        if chars[i] == '\n' {
                            line += 1;
                            col = 0;
                            i += 1;
                            continue;
                        }
                        col += 1;
                        if chars[i] == quote
                            && i + 2 < chars.len()
                            && chars[i + 1] == quote
                            && chars[i + 2] == quote
                        {
                            i += 3;
                            col += 2;
                            closed = true;
                            break;
                        }
                        i += 1;
                    }
                    if !closed {
                        return Some((
                            "unterminated triple-quoted string".to_string(),
                            start_line,
                            start_col,
                        ));
                    }
                    continue;
                }
                // Single-line string.
                i += 1;
                loop {
                    if i >= chars.len() || chars[i] == '\n' {
                        return Some((
                            "unterminated string literal".to_string(),
                            start_line,
                            start_col,
                        ));
                    }
                    col += 1;
                    if chars[i] == '\\' {
                        i += 2;
                        col += 1;
                        continue;
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line, col)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _, _)) if open == expected => {}
                    _ => return Some((format!("unmatched '{c}'"), line, col)),
                }
            }
            _ => {}
        }
        i += 1;
    }

    stack
        .pop()
        .map(|(open, line, col)| (format!("unclosed '{open}'"), line, col))
}

fn syntax_error_payload(message: &str, line: usize, col: usize) -> Value {
    serde_json::json!({
        "error": format!(
            "Python code failed syntax preflight at line {line}, column {col}: {message}."
        ),
        "error_code": "python_compile_error",
        "retryable": true,
        "line": line,
        "column": col,
    })
}

/// The preflight error payload, or `None` when the code may run.
pub fn preflight_error_payload(code: &str, execution_code: &str) -> Option<Value> {
    let invalid = detect_tool_invocations(code);
    if !invalid.is_empty() {
        return Some(serde_json::json!({
            "error": format!(
                "Python code attempted to call backend tools directly ({}). Use tool calls at the model level (run_sql/run_python) and keep Python as plain executable analysis code.",
                invalid.join(", ")
            ),
            "error_code": "python_tool_invocation_forbidden",
            "retryable": true,
            "invalid_tool_calls": invalid,
        }));
    }

    if let Some((message, line, col)) = syntax_check(code) {
        return Some(syntax_error_payload(&message, line, col));
    }

    if let Some((message, line, col)) = syntax_check(execution_code) {
        let mut payload = syntax_error_payload(&message, line, col);
        payload["error_code"] = Value::from("python_execution_payload_compile_error");
        payload["error"] = Value::from(format!(
            "Generated execution payload failed syntax preflight before sandbox run: {message} at line {line}, column {col}."
        ));
        return Some(payload);
    }

    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution payload construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Prior successful python cells on the ancestor chain, oldest first.
pub fn successful_python_codes(events: &[EventRecord]) -> Vec<String> {
    let mut codes = Vec::new();
    for event in events {
        if event.event_type != EventType::ToolResultPython || event.has_error() {
            continue;
        }
        let call = event
            .parent_event_id
            .as_ref()
            .and_then(|parent_id| events.iter().find(|e| e.id == *parent_id));
        let call = match call {
            Some(call) if call.event_type == EventType::ToolCallPython => call,
            _ => continue,
        };
        if let Some(code) = call.payload.get("code").and_then(Value::as_str) {
            if !code.is_empty() {
                codes.push(code.to_string());
            }
        }
    }
    codes
}

/// The most recent successful SQL result payload on the chain.
pub fn latest_successful_sql_result(events: &[EventRecord]) -> Option<&Value> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == EventType::ToolResultSql && !e.has_error())
        .map(|e| &e.payload)
}

/// JSON-inject the latest SQL result as `LATEST_SQL_RESULT` and (when
/// pandas imports) `LATEST_SQL_DF`.
pub fn build_sql_context_code(latest_sql_result: Option<&Value>) -> String {
    let result = match latest_sql_result {
        Some(result) => result,
        None => return String::new(),
    };
    let serialized = result.to_string();
    let escaped = serialized.replace('\\', "\\\\").replace('\'', "\\'");
    [
        "import json".to_string(),
        format!("LATEST_SQL_RESULT = json.loads('{escaped}')"),
        "LATEST_SQL_COLUMNS = [c.get('name', '') for c in (LATEST_SQL_RESULT.get('columns') or []) if isinstance(c, dict)]".to_string(),
        "LATEST_SQL_ROWS = LATEST_SQL_RESULT.get('rows') or []".to_string(),
        "try:".to_string(),
        "    import pandas as pd".to_string(),
        "    LATEST_SQL_DF = pd.DataFrame(LATEST_SQL_ROWS, columns=LATEST_SQL_COLUMNS)".to_string(),
        "except Exception:".to_string(),
        "    LATEST_SQL_DF = None".to_string(),
    ]
    .join("\n")
}

fn indent(code: &str) -> String {
    code.lines()
        .map(|line| {
            if line.trim().is_empty() {
                line.to_string()
            } else {
                format!("    {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Re-execute prior successful cells with captured-and-discarded output
/// before the current cell.
pub fn build_replay_code(prior_codes: &[String], current_code: &str) -> String {
    if prior_codes.is_empty() {
        return current_code.to_string();
    }

    let mut chunks = vec!["import contextlib".to_string(), "import io".to_string()];
    for (idx, code) in prior_codes.iter().enumerate() {
        chunks.push(
            [
                format!("# replay_step_{}", idx + 1),
                "_replay_stdout = io.StringIO()".to_string(),
                "_replay_stderr = io.StringIO()".to_string(),
                "with contextlib.redirect_stdout(_replay_stdout), contextlib.redirect_stderr(_replay_stderr):"
                    .to_string(),
                indent(code),
            ]
            .join("\n"),
        );
    }
    chunks.push(format!("# current_step\n{current_code}"));
    chunks.join("\n\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute the Python tool. Preflight failures, capacity rejections,
/// and sandbox errors are reified into the persisted result payload;
/// only store failures surface as `Err`.
pub async fn execute_python_tool(
    store: &MetaStore,
    sandboxes: &SandboxManager,
    capacity: &CapacityController,
    req: &PythonToolRequest,
    signals: &TurnSignals,
) -> Result<Value> {
    store.worldline(&req.worldline_id)?;
    let started = Instant::now();

    let history = store.rebuild_history(&req.worldline_id)?;
    let prior_codes = successful_python_codes(&history);
    let sql_context = build_sql_context_code(latest_successful_sql_result(&history));

    // Warm sandboxes already hold prior state; replay only on cold start.
    let warm = sandboxes.is_warm(&req.worldline_id);
    let replay_codes: &[String] = if warm { &[] } else { &prior_codes };
    let mut execution_code = build_replay_code(replay_codes, &req.code);
    if !sql_context.is_empty() {
        execution_code = format!("{sql_context}\n\n{execution_code}");
    }
    tracing::debug!(
        worldline_id = %req.worldline_id,
        warm,
        replay_steps = replay_codes.len(),
        has_sql_context = !sql_context.is_empty(),
        "built python execution payload"
    );

    let mut call_payload = serde_json::json!({
        "code": req.code,
        "timeout": req.timeout,
    });
    if let Some(call_id) = &req.call_id {
        call_payload["call_id"] = Value::from(call_id.clone());
    }
    let call_event = store.append_event(&req.worldline_id, EventType::ToolCallPython, &call_payload)?;
    signals.emit_event(&req.worldline_id, &call_event).await;

    // Preflight before any sandbox work.
    if let Some(payload) = preflight_error_payload(&req.code, &execution_code) {
        tracing::debug!(
            worldline_id = %req.worldline_id,
            error_code = payload["error_code"].as_str().unwrap_or(""),
            "python preflight blocked sandbox execution"
        );
        let result_event = store.append_and_advance(
            &req.worldline_id,
            Some(&call_event.id),
            EventType::ToolResultPython,
            &payload,
        )?;
        signals.emit_event(&req.worldline_id, &result_event).await;
        return Ok(payload);
    }

    // Python-pool admission, then sandbox execution. The lease is held
    // for the duration of the sandbox call.
    let outcome = match capacity.lease_python().await {
        Ok(_lease) => {
            sandboxes
                .execute(&req.worldline_id, &execution_code, req.timeout)
                .await
        }
        Err(err) => Err(err),
    };

    let result_payload = match outcome {
        Ok(raw) => {
            let mut api_artifacts = Vec::new();
            let mut registered = Vec::new();
            for artifact in &raw.artifacts {
                if artifact.path.is_empty() {
                    continue;
                }
                registered.push(artifact);
            }

            let payload_error = raw.error.clone();
            let mut payload = serde_json::json!({
                "stdout": raw.stdout,
                "stderr": raw.stderr,
                "error": payload_error,
                "previews": {"dataframes": []},
                "execution_ms": started.elapsed().as_millis() as u64,
            });

            let result_event = {
                // Reserve artifact ids so payload and rows agree.
                let mut rows = Vec::new();
                for artifact in registered {
                    let id = wl_domain::id::new_id("artifact");
                    api_artifacts.push(serde_json::json!({
                        "artifact_id": id,
                        "type": artifact.artifact_type,
                        "name": artifact.name,
                    }));
                    rows.push((id, artifact));
                }
                payload["artifacts"] = Value::from(api_artifacts);

                let result_event = store.append_and_advance(
                    &req.worldline_id,
                    Some(&call_event.id),
                    EventType::ToolResultPython,
                    &payload,
                )?;
                for (id, artifact) in rows {
                    store.create_artifact_with_id(
                        &id,
                        &req.worldline_id,
                        &result_event.id,
                        &artifact.artifact_type,
                        &artifact.name,
                        &artifact.path,
                    )?;
                }
                result_event
            };
            signals.emit_event(&req.worldline_id, &result_event).await;
            return Ok(payload);
        }
        Err(Error::SandboxCapacity(msg)) => serde_json::json!({
            "error": msg,
            "error_code": "sandbox_capacity",
            "retryable": true,
        }),
        Err(Error::CapacityLimit(msg)) => serde_json::json!({
            "error": msg,
            "error_code": "python_capacity_limit_reached",
            "retryable": true,
        }),
        Err(err) => serde_json::json!({
            "error": err.to_string(),
            "error_code": "python_runtime_error",
            "retryable": false,
        }),
    };

    let result_event = store.append_and_advance(
        &req.worldline_id,
        Some(&call_event.id),
        EventType::ToolResultPython,
        &result_payload,
    )?;
    signals.emit_event(&req.worldline_id, &result_event).await;
    Ok(result_payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Preflight ───────────────────────────────────────────────────

    #[test]
    fn forbidden_tool_invocations_are_detected() {
        let payload = preflight_error_payload("df = run_sql('SELECT 1')", "x = 1").unwrap();
        assert_eq!(payload["error_code"], "python_tool_invocation_forbidden");
        assert_eq!(payload["retryable"], true);
        assert_eq!(payload["invalid_tool_calls"][0], "run_sql");

        // Mentioning the name without a call is fine.
        assert!(preflight_error_payload("# run_sql is a tool", "x = 1").is_none());
    }

    #[test]
    fn unbalanced_code_fails_with_location() {
        let payload = preflight_error_payload("x = (1 + 2", "x = (1 + 2").unwrap();
        assert_eq!(payload["error_code"], "python_compile_error");
        assert_eq!(payload["retryable"], true);
        assert_eq!(payload["line"], 1);
        assert_eq!(payload["column"], 5);
    }

    #[test]
    fn unterminated_string_fails() {
        let code = "s = 'oops\nprint(s)";
        let payload = preflight_error_payload(code, code).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("unterminated string"));
        assert_eq!(payload["line"], 1);
    }

    #[test]
    fn well_formed_code_passes_preflight() {
        let code = "import pandas as pd\ndf = LATEST_SQL_DF\nprint(df.head())  # preview\ns = \"a 'quoted' value\"\nt = '''multi\nline'''";
        assert!(preflight_error_payload(code, code).is_none());
    }

    #[test]
    fn brackets_inside_strings_and_comments_are_ignored() {
        let code = "s = \"(unclosed [in string\"\n# also ( in comment\nprint(s)";
        assert!(preflight_error_payload(code, code).is_none());

        let payload = preflight_error_payload("x = [1, 2)", "x = [1, 2)").unwrap();
        assert!(payload["error"].as_str().unwrap().contains("unmatched ')'"));
    }

    #[test]
    fn execution_payload_errors_use_distinct_code() {
        let payload = preflight_error_payload("x = 1", "broken = (((").unwrap();
        assert_eq!(payload["error_code"], "python_execution_payload_compile_error");
    }

    // ── Payload construction ────────────────────────────────────────

    #[test]
    fn sql_context_embeds_escaped_json() {
        let result = serde_json::json!({
            "columns": [{"name": "x", "type": "INTEGER"}],
            "rows": [["it's"]],
        });
        let code = build_sql_context_code(Some(&result));
        assert!(code.contains("LATEST_SQL_RESULT = json.loads('"));
        assert!(code.contains("it\\'s"));
        assert!(code.contains("LATEST_SQL_DF"));
        assert!(build_sql_context_code(None).is_empty());
    }

    #[test]
    fn replay_code_wraps_prior_cells() {
        let prior = vec!["x = 1\nprint(x)".to_string(), "y = x + 1".to_string()];
        let code = build_replay_code(&prior, "print(y)");
        assert!(code.contains("# replay_step_1"));
        assert!(code.contains("# replay_step_2"));
        assert!(code.contains("    x = 1"));
        assert!(code.contains("with contextlib.redirect_stdout"));
        assert!(code.ends_with("# current_step\nprint(y)"));

        assert_eq!(build_replay_code(&[], "print(1)"), "print(1)");
    }
}
