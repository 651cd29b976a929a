//! Subagent fan-out / fan-in.
//!
//! The parent turn branches one child worldline per task off a resolved
//! fork event, submits the child turns through the turn coordinator
//! under the subagent pool (bounded by `max_parallel_subagents`),
//! retries transient failures with jittered backoff, performs one
//! synthesis-only retry on loop-limit terminals, enforces a single
//! global deadline, and aggregates everything into one
//! `tool_result_subagents` event. Artifacts of completed children are
//! copied into the parent workspace under label-derived prefixes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use wl_domain::event::{EventRecord, EventType};
use wl_domain::id::new_id;
use wl_domain::tool::{truncate_str, ChatMessage};
use wl_domain::turn::{TurnOutcome, LOOP_LIMIT_REASON};
use wl_domain::worldline::BranchOptions;
use wl_domain::{Error, Result};
use wl_providers::{GenerateRequest, LlmClient};
use wl_store::MetaStore;

use crate::artifact_merge;
use crate::capacity::CapacityController;
use crate::coordinator::TurnCoordinator;
use crate::dispatcher::ToolDispatcher;
use crate::engine::TurnEngine;
use crate::signals::TurnSignals;
use crate::toolargs::SpawnArgs;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Case-insensitive marker of the loop-limit terminal assistant text.
pub const LOOP_LIMIT_TEXT_MARKER: &str = "i reached the tool-loop limit";
const LOOP_LIMIT_FAILURE_CODE: &str = "subagent_loop_limit";

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY_BASE: Duration = Duration::from_secs(1);
const RETRY_DELAY_MAX: Duration = Duration::from_secs(8);
const RETRYABLE_ERROR_SUBSTRINGS: &[&str] = &[
    "429",
    "503",
    "timeout",
    "connection",
    "network",
    "temporarily unavailable",
];

const ASSISTANT_PREVIEW_CHARS: usize = 220;
const ERROR_MAX_CHARS: usize = 4000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fork-point resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a safe fork event: the requested event when it is reachable
/// from the head, otherwise the current head with a recorded reason.
/// Never fails the call over an ambiguous fork point.
pub fn resolve_fork_event_id_or_head(
    store: &MetaStore,
    source_worldline_id: &str,
    requested_from_event_id: Option<&str>,
) -> Result<(String, Option<&'static str>)> {
    let worldline = store.worldline(source_worldline_id)?;
    let head = worldline
        .head_event_id
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| {
            Error::bad_request("spawn_subagents requires a non-empty worldline timeline")
        })?;

    let requested = match requested_from_event_id.map(str::trim).filter(|s| !s.is_empty()) {
        None => return Ok((head, Some("defaulted_to_current_head"))),
        Some(requested) => requested,
    };
    if requested == head {
        return Ok((requested.to_string(), None));
    }
    if store.event_in_history(&head, requested)? {
        return Ok((requested.to_string(), None));
    }
    if store.event_exists(requested)? {
        Ok((head, Some("requested_from_event_id_not_in_history_fell_back_to_head")))
    } else {
        Ok((head, Some("requested_from_event_id_not_found_fell_back_to_head")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task derivation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub label: String,
    pub message: String,
    pub branch_name: Option<String>,
}

/// Deterministic split used when the LLM cannot produce parseable
/// tasks: schema scout, core metrics, quality checks.
pub fn fallback_task_split(goal: &str, max_tasks: usize) -> Vec<TaskSpec> {
    let clean_goal = goal.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean_goal.is_empty() {
        return Vec::new();
    }
    let base = vec![
        TaskSpec {
            label: "schema-scout".into(),
            message: format!(
                "Investigate schema and relevant tables for this goal: {clean_goal}. Return only the key tables/columns needed."
            ),
            branch_name: None,
        },
        TaskSpec {
            label: "metrics-core".into(),
            message: format!(
                "Compute the core metrics and primary findings for this goal: {clean_goal}. Focus on concise, high-signal results."
            ),
            branch_name: None,
        },
        TaskSpec {
            label: "quality-checks".into(),
            message: format!(
                "Investigate anomalies, edge-cases, and caveats for this goal: {clean_goal}. Return risks, outliers, and confidence notes."
            ),
            branch_name: None,
        },
    ];
    let keep = max_tasks.clamp(1, base.len());
    base.into_iter().take(keep).collect()
}

/// Ask the LLM to split a goal into 2..max strict-JSON tasks, falling
/// back to the deterministic split on unparseable output.
pub async fn derive_tasks_from_goal(
    llm: &Arc<dyn LlmClient>,
    goal: &str,
    max_tasks: usize,
) -> Vec<TaskSpec> {
    let goal = goal.trim();
    if goal.is_empty() {
        return Vec::new();
    }

    let prompt = format!(
        "Split the user goal into independent parallel analysis tasks. \
         Return strict JSON with shape: {{\"tasks\":[{{\"label\":\"short-id\",\"message\":\"task prompt\"}}]}}. \
         Create between 2 and {} tasks. Each message must be concrete and self-contained. No markdown.",
        max_tasks.clamp(2, 10)
    );
    let response = llm
        .generate(GenerateRequest {
            messages: vec![ChatMessage::system(prompt), ChatMessage::user(goal)],
            tools: Vec::new(),
            max_output_tokens: None,
            model: None,
        })
        .await;

    let text = match &response {
        Ok(response) => response.text.trim().to_string(),
        Err(err) => {
            tracing::warn!(error = %err, "goal split failed, using fallback tasks");
            return fallback_task_split(goal, max_tasks);
        }
    };

    let parsed: Value = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(_) => return fallback_task_split(goal, max_tasks),
    };
    let tasks = match parsed.get("tasks").and_then(Value::as_array) {
        Some(tasks) => tasks,
        None => return fallback_task_split(goal, max_tasks),
    };

    let mut output = Vec::new();
    for (idx, entry) in tasks.iter().enumerate() {
        let entry = match entry.as_object() {
            Some(entry) => entry,
            None => continue,
        };
        let message = entry
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if message.is_empty() {
            continue;
        }
        let label = entry
            .get("label")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("task-{}", idx + 1));
        output.push(TaskSpec {
            label: truncate_to(&label, 80),
            message: truncate_to(message, 4000),
            branch_name: None,
        });
        if output.len() >= max_tasks {
            break;
        }
    }

    if output.is_empty() {
        fallback_task_split(goal, max_tasks)
    } else {
        output
    }
}

fn truncate_to(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Resolve the task list: explicit tasks truncated to `max_subagents`,
/// else a goal split. Returns `(tasks, requested_count, truncated_count)`.
async fn resolve_tasks(
    llm: &Arc<dyn LlmClient>,
    args: &SpawnArgs,
) -> Result<(Vec<TaskSpec>, usize, usize)> {
    let mut resolved: Vec<TaskSpec> = Vec::new();
    let mut requested = 0usize;

    if let Some(tasks) = &args.tasks {
        requested = tasks.len();
        for entry in tasks {
            if resolved.len() >= args.max_subagents {
                break;
            }
            let entry = match entry.as_object() {
                Some(entry) => entry,
                None => continue,
            };
            let index = resolved.len() + 1;
            let message = entry
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if message.is_empty() {
                return Err(Error::bad_request(format!(
                    "spawn_subagents task #{index} message must be non-empty"
                )));
            }
            let label = entry
                .get("label")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("task-{index}"));
            let branch_name = entry
                .get("branch_name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string);
            resolved.push(TaskSpec {
                label,
                message: message.to_string(),
                branch_name,
            });
        }
    }

    if resolved.is_empty() {
        if let Some(goal) = &args.goal {
            resolved = derive_tasks_from_goal(llm, goal, args.max_subagents).await;
        }
    }
    if resolved.is_empty() {
        return Err(Error::bad_request(
            "spawn_subagents could not derive tasks from input",
        ));
    }

    if requested == 0 {
        requested = resolved.len();
    }
    let truncated = requested.saturating_sub(resolved.len());
    Ok((resolved, requested, truncated))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child-turn outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn is_retryable_error(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lowered = message.to_lowercase();
    RETRYABLE_ERROR_SUBSTRINGS
        .iter()
        .any(|substr| lowered.contains(substr))
}

fn state_trace_reasons(payload: &Value) -> Vec<String> {
    payload
        .get("state_trace")
        .and_then(Value::as_array)
        .map(|trace| {
            trace
                .iter()
                .filter_map(|step| step.get("reason").and_then(Value::as_str))
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn terminal_reason_from_events(events: &[EventRecord]) -> Option<String> {
    let payload = wl_domain::event::last_assistant_payload(events)?;
    let reasons = state_trace_reasons(payload);
    if reasons.iter().any(|r| r == LOOP_LIMIT_REASON) {
        return Some(LOOP_LIMIT_REASON.to_string());
    }
    if let Some(last) = reasons.last() {
        return Some(last.clone());
    }
    let text = payload.get("text").and_then(Value::as_str)?;
    text.to_lowercase()
        .contains(LOOP_LIMIT_TEXT_MARKER)
        .then(|| LOOP_LIMIT_REASON.to_string())
}

fn is_loop_limit_outcome(events: &[EventRecord], assistant_text: Option<&str>) -> bool {
    if let Some(text) = assistant_text {
        if text.to_lowercase().contains(LOOP_LIMIT_TEXT_MARKER) {
            return true;
        }
    }
    wl_domain::event::last_assistant_payload(events)
        .map(|payload| state_trace_reasons(payload).iter().any(|r| r == LOOP_LIMIT_REASON))
        .unwrap_or(false)
}

struct AttemptOutcome {
    result_worldline_id: String,
    assistant_text: Option<String>,
    assistant_preview: String,
    terminal_reason: Option<String>,
    is_loop_limit: bool,
    events_count: usize,
}

impl AttemptOutcome {
    fn from_turn(outcome: TurnOutcome) -> Self {
        let assistant_text =
            wl_domain::event::last_assistant_text(&outcome.events).map(str::to_string);
        let assistant_preview =
            truncate_str(assistant_text.as_deref().unwrap_or(""), ASSISTANT_PREVIEW_CHARS);
        let terminal_reason = terminal_reason_from_events(&outcome.events);
        let is_loop_limit = is_loop_limit_outcome(&outcome.events, assistant_text.as_deref());
        Self {
            result_worldline_id: outcome.worldline_id,
            events_count: outcome.events.len(),
            assistant_text,
            assistant_preview,
            terminal_reason,
            is_loop_limit,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct ChildRun {
    task_index: usize,
    task_label: String,
    task_message: String,
    child_worldline_id: String,
    branch_name: String,
    ordering_key: String,
}

#[derive(Debug, Clone, Serialize)]
struct TaskRecord {
    task_index: usize,
    task_label: String,
    task_message: String,
    child_worldline_id: String,
    branch_name: String,
    ordering_key: String,
    status: String,
    error: Option<String>,
    failure_code: Option<String>,
    retry_count: u32,
    recovered: bool,
    terminal_reason: Option<String>,
    result_worldline_id: String,
    assistant_preview: String,
    assistant_text: Option<String>,
}

impl TaskRecord {
    fn base(run: &ChildRun) -> Self {
        Self {
            task_index: run.task_index,
            task_label: run.task_label.clone(),
            task_message: run.task_message.clone(),
            child_worldline_id: run.child_worldline_id.clone(),
            branch_name: run.branch_name.clone(),
            ordering_key: run.ordering_key.clone(),
            status: "failed".into(),
            error: None,
            failure_code: None,
            retry_count: 0,
            recovered: false,
            terminal_reason: None,
            result_worldline_id: run.child_worldline_id.clone(),
            assistant_preview: String::new(),
            assistant_text: None,
        }
    }

    fn timeout(run: &ChildRun, timeout_s: u64, retry_count: u32) -> Self {
        Self {
            status: "timeout".into(),
            error: Some(format!("timed out after waiting {timeout_s}s for child run")),
            failure_code: Some("subagent_timeout".into()),
            retry_count,
            terminal_reason: Some("timeout".into()),
            ..Self::base(run)
        }
    }

    fn failed(run: &ChildRun, error: &str, failure_code: &str, retry_count: u32) -> Self {
        Self {
            status: "failed".into(),
            error: Some(truncate_str(error, ERROR_MAX_CHARS)),
            failure_code: Some(failure_code.into()),
            retry_count,
            terminal_reason: Some("error".into()),
            ..Self::base(run)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Progress frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ProgressState {
    statuses: HashMap<usize, String>,
    seq: u64,
}

struct ProgressTracker {
    signals: TurnSignals,
    parent_worldline_id: String,
    fanout_group_id: String,
    parent_tool_call_id: Option<String>,
    from_event_id: String,
    task_count: usize,
    max_subagents: usize,
    max_parallel_subagents: usize,
    state: Mutex<ProgressState>,
}

#[allow(clippy::too_many_arguments)]
impl ProgressTracker {
    /// Emit a progress frame on a status edge (or when forced), with a
    /// monotonically increasing `group_seq` and per-status counters.
    async fn emit(
        &self,
        run: &ChildRun,
        status: &str,
        phase: &str,
        result_worldline_id: Option<&str>,
        assistant_preview: &str,
        error: Option<&str>,
        queue_reason: Option<&str>,
        retry_count: u32,
        force: bool,
    ) {
        if !self.signals.is_active() {
            return;
        }

        let frame = {
            let mut state = self.state.lock();
            let previous = state.statuses.get(&run.task_index);
            if previous.map(String::as_str) == Some(status) && !force {
                return;
            }
            state.statuses.insert(run.task_index, status.to_string());

            let mut queued_count = 0usize;
            let mut running_count = 0usize;
            let mut completed_count = 0usize;
            let mut failed_count = 0usize;
            let mut timed_out_count = 0usize;
            for value in state.statuses.values() {
                match value.as_str() {
                    "queued" => queued_count += 1,
                    "running" => running_count += 1,
                    "completed" => completed_count += 1,
                    "timeout" => timed_out_count += 1,
                    _ => failed_count += 1,
                }
            }

            state.seq += 1;
            serde_json::json!({
                "type": "subagent_progress",
                "call_id": self.parent_tool_call_id,
                "fanout_group_id": self.fanout_group_id,
                "group_seq": state.seq,
                "parent_tool_call_id": self.parent_tool_call_id,
                "source_worldline_id": self.parent_worldline_id,
                "from_event_id": self.from_event_id,
                "task_index": run.task_index,
                "task_label": run.task_label,
                "task_status": status,
                "phase": phase,
                "task_count": self.task_count,
                "max_subagents": self.max_subagents,
                "max_parallel_subagents": self.max_parallel_subagents,
                "child_worldline_id": run.child_worldline_id,
                "result_worldline_id": result_worldline_id,
                "ordering_key": run.ordering_key,
                "assistant_preview": assistant_preview,
                "error": error,
                "queue_reason": queue_reason,
                "retry_count": retry_count,
                "queued_count": queued_count,
                "running_count": running_count,
                "completed_count": completed_count,
                "failed_count": failed_count,
                "timed_out_count": timed_out_count,
            })
        };

        self.signals.emit_delta(&self.parent_worldline_id, frame).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct FanoutDeps {
    store: Arc<MetaStore>,
    llm: Arc<dyn LlmClient>,
    dispatcher: ToolDispatcher,
    coordinator: TurnCoordinator,
    capacity: Arc<CapacityController>,
}

/// One child attempt: serialized through the turn coordinator and
/// retried with exponential backoff on transient indicators.
///
/// Boxed explicitly (rather than left as `async fn`) because this
/// function sits in a recursive async call cycle (child turns may
/// themselves dispatch `spawn_subagents`); rustc cannot otherwise
/// resolve the opaque return type's auto traits within that cycle.
fn run_child_attempt_with_retry<'a>(
    deps: &'a FanoutDeps,
    child_worldline_id: &'a str,
    message: &'a str,
    max_iterations: u32,
    allow_tools: bool,
) -> futures_util::future::BoxFuture<'a, Result<TurnOutcome>> {
    async move {
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let store = deps.store.clone();
        let llm = deps.llm.clone();
        let dispatcher = deps.dispatcher.clone();
        let wid = child_worldline_id.to_string();
        let task_message = message.to_string();
        // The child turn re-enters the engine (and so this module); the
        // future is boxed to keep the async type acyclic.
        let result = deps
            .coordinator
            .run(child_worldline_id, move || {
                async move {
                    let engine = TurnEngine::for_subagent(
                        store,
                        llm,
                        dispatcher,
                        max_iterations,
                        1,
                        allow_tools,
                    );
                    engine.run_turn(&wid, &task_message, &TurnSignals::none()).await
                }
                .boxed()
            })
            .await;

        match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                let message = err.to_string();
                if attempt >= RETRY_MAX_ATTEMPTS || !is_retryable_error(&message) {
                    return Err(err);
                }
                let backoff = RETRY_DELAY_BASE
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(RETRY_DELAY_MAX);
                let jitter = rand::thread_rng().gen_range(0.0..0.5);
                let delay = backoff.mul_f64(1.0 + jitter);
                tracing::warn!(
                    child_worldline_id,
                    attempt,
                    error = %truncate_str(&message, 200),
                    delay_ms = delay.as_millis() as u64,
                    "retrying transient subagent failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    }
    .boxed()
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    deps: FanoutDeps,
    run: ChildRun,
    progress: Arc<ProgressTracker>,
    parallel: Arc<tokio::sync::Semaphore>,
    capacity_wait_ms: Arc<AtomicU64>,
    max_iterations: u32,
) -> TaskRecord {
    let _slot = match parallel.acquire_owned().await {
        Ok(slot) => slot,
        Err(_) => {
            return TaskRecord::failed(&run, "parallelism gate closed", "subagent_error", 0);
        }
    };

    let lease = match deps.capacity.lease_subagent().await {
        Ok(lease) => lease,
        Err(err) => {
            let message = err.to_string();
            progress
                .emit(
                    &run,
                    "failed",
                    "finished",
                    Some(run.child_worldline_id.as_str()),
                    "",
                    Some(message.as_str()),
                    Some("capacity_limit_reached"),
                    0,
                    false,
                )
                .await;
            return TaskRecord::failed(&run, &message, "subagent_capacity_limit_reached", 0);
        }
    };
    capacity_wait_ms.fetch_add(lease.wait_ms, Ordering::AcqRel);

    progress
        .emit(
            &run,
            "running",
            "started",
            None,
            "",
            None,
            lease.queue_reason,
            0,
            false,
        )
        .await;
    tracing::info!(
        task_label = %run.task_label,
        child_worldline_id = %run.child_worldline_id,
        "subagent child starting"
    );

    let mut retry_count = 0u32;
    let initial = match run_child_attempt_with_retry(
        &deps,
        &run.child_worldline_id,
        &run.task_message,
        max_iterations,
        true,
    )
    .await
    {
        Ok(outcome) => AttemptOutcome::from_turn(outcome),
        Err(err) => {
            let message = err.to_string();
            tracing::error!(
                task_label = %run.task_label,
                child_worldline_id = %run.child_worldline_id,
                error = %truncate_str(&message, 200),
                "subagent child failed"
            );
            progress
                .emit(
                    &run,
                    "failed",
                    "finished",
                    Some(run.child_worldline_id.as_str()),
                    "",
                    Some(message.as_str()),
                    None,
                    retry_count,
                    false,
                )
                .await;
            return TaskRecord::failed(&run, &message, "subagent_error", retry_count);
        }
    };

    let mut recovered = false;
    let final_attempt = if initial.is_loop_limit {
        // Synthesis-only retry: same task, tools withheld, so the model
        // writes up what it already observed.
        retry_count = 1;
        progress
            .emit(
                &run,
                "running",
                "retrying",
                Some(initial.result_worldline_id.as_str()),
                &initial.assistant_preview,
                None,
                None,
                retry_count,
                true,
            )
            .await;
        match run_child_attempt_with_retry(
            &deps,
            &initial.result_worldline_id,
            &run.task_message,
            max_iterations,
            false,
        )
        .await
        {
            Ok(outcome) => {
                let attempt = AttemptOutcome::from_turn(outcome);
                recovered = !attempt.is_loop_limit;
                attempt
            }
            Err(err) => {
                let message = err.to_string();
                progress
                    .emit(
                        &run,
                        "failed",
                        "finished",
                        Some(initial.result_worldline_id.as_str()),
                        &initial.assistant_preview,
                        Some(message.as_str()),
                        None,
                        retry_count,
                        false,
                    )
                    .await;
                return TaskRecord::failed(&run, &message, "subagent_error", retry_count);
            }
        }
    } else {
        initial
    };

    if !recovered && retry_count == 1 {
        let error = "subagent reached tool-loop limit after synthesis-only retry";
        progress
            .emit(
                &run,
                "failed",
                "finished",
                Some(final_attempt.result_worldline_id.as_str()),
                &final_attempt.assistant_preview,
                Some(error),
                None,
                retry_count,
                false,
            )
            .await;
        tracing::warn!(
            task_label = %run.task_label,
            result_worldline_id = %final_attempt.result_worldline_id,
            "subagent loop-limit terminal"
        );
        return TaskRecord {
            status: "failed".into(),
            error: Some(error.to_string()),
            failure_code: Some(LOOP_LIMIT_FAILURE_CODE.into()),
            retry_count,
            recovered: false,
            terminal_reason: Some(LOOP_LIMIT_REASON.into()),
            result_worldline_id: final_attempt.result_worldline_id.clone(),
            assistant_preview: final_attempt.assistant_preview.clone(),
            assistant_text: final_attempt.assistant_text.clone(),
            ..TaskRecord::base(&run)
        };
    }

    progress
        .emit(
            &run,
            "completed",
            "finished",
            Some(final_attempt.result_worldline_id.as_str()),
            &final_attempt.assistant_preview,
            None,
            None,
            retry_count,
            false,
        )
        .await;
    tracing::info!(
        task_label = %run.task_label,
        result_worldline_id = %final_attempt.result_worldline_id,
        events = final_attempt.events_count,
        retry_count,
        recovered,
        "subagent child completed"
    );
    TaskRecord {
        status: "completed".into(),
        error: None,
        failure_code: None,
        retry_count,
        recovered,
        terminal_reason: final_attempt.terminal_reason.clone(),
        result_worldline_id: final_attempt.result_worldline_id.clone(),
        assistant_preview: final_attempt.assistant_preview.clone(),
        assistant_text: final_attempt.assistant_text.clone(),
        ..TaskRecord::base(&run)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fan-out entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the whole fan-out, persisting the parent's
/// `tool_call_subagents` / `tool_result_subagents` pair around it and
/// merging child artifacts into the parent on fan-in. Caller errors are
/// reified into the persisted result payload.
pub async fn run_spawn_subagents(
    dispatcher: &ToolDispatcher,
    parent_worldline_id: &str,
    parent_tool_call_id: Option<String>,
    args: SpawnArgs,
    signals: &TurnSignals,
) -> Result<Value> {
    let deps = FanoutDeps {
        store: dispatcher.store().clone(),
        llm: dispatcher.llm().clone(),
        dispatcher: dispatcher.clone(),
        coordinator: dispatcher.coordinator().clone(),
        capacity: dispatcher.capacity().clone(),
    };
    let fanout_group_id = new_id("fanout");

    let call_meta = |prepared: Value| -> Value {
        let mut payload = serde_json::json!({
            "goal": args.goal.clone(),
            "tasks": args.tasks.clone(),
            "requested_from_event_id": args.from_event_id.clone(),
            "timeout_s": args.timeout_s,
            "max_iterations": args.max_iterations,
            "max_subagents": args.max_subagents,
            "max_parallel_subagents": args.max_parallel_subagents,
            "call_id": parent_tool_call_id.clone(),
        });
        if let (Some(target), Some(source)) = (payload.as_object_mut(), prepared.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        payload
    };

    // Resolve the fork point; never fail over ambiguity, but a missing
    // timeline is a caller error reified into the persisted pair.
    let (from_event_id, from_event_resolution) = match resolve_fork_event_id_or_head(
        &deps.store,
        parent_worldline_id,
        args.from_event_id.as_deref(),
    ) {
        Ok(resolved) => resolved,
        Err(Error::BadRequest(message)) | Err(Error::NotFound(message)) => {
            return persist_failed_call(
                &deps.store,
                parent_worldline_id,
                call_meta(empty_prepared()),
                serde_json::json!({"error": message}),
                signals,
            )
            .await;
        }
        Err(err) => return Err(err),
    };

    let (tasks, requested_count, truncated_count) = match resolve_tasks(&deps.llm, &args).await {
        Ok(resolved) => resolved,
        Err(Error::BadRequest(message)) => {
            let mut meta = call_meta(empty_prepared());
            meta["from_event_id"] = Value::from(from_event_id.clone());
            meta["from_event_resolution"] = to_value_or_null(from_event_resolution);
            return persist_failed_call(
                &deps.store,
                parent_worldline_id,
                meta,
                serde_json::json!({"error": message}),
                signals,
            )
            .await;
        }
        Err(err) => return Err(err),
    };
    let accepted_count = tasks.len();

    tracing::info!(
        parent_worldline_id,
        fanout_group_id = %fanout_group_id,
        task_count = accepted_count,
        timeout_s = args.timeout_s,
        max_iterations = args.max_iterations,
        "spawning subagents"
    );

    // Branch one child worldline per task (no prologue, no carried
    // message) and record the accepted set.
    let mut child_runs = Vec::with_capacity(accepted_count);
    let mut accepted_tasks = Vec::with_capacity(accepted_count);
    for (idx, task) in tasks.iter().enumerate() {
        let branch_name = task
            .branch_name
            .clone()
            .unwrap_or_else(|| format!("subagent-{}", idx + 1));
        let branch = deps.store.branch_from_event(&BranchOptions {
            source_worldline_id: parent_worldline_id.to_string(),
            from_event_id: from_event_id.clone(),
            name: Some(branch_name),
            append_events: false,
            carried_user_message: None,
        })?;
        let ordering_key = format!("{fanout_group_id}:{idx}");
        accepted_tasks.push(serde_json::json!({
            "task_index": idx,
            "task_label": task.label,
            "branch_name": branch.name,
            "child_worldline_id": branch.new_worldline_id,
            "ordering_key": ordering_key,
        }));
        child_runs.push(ChildRun {
            task_index: idx,
            task_label: task.label.clone(),
            task_message: task.message.clone(),
            child_worldline_id: branch.new_worldline_id,
            branch_name: branch.name,
            ordering_key,
        });
    }

    // Persist the parent's call event now that the task set is fixed.
    let call_payload = {
        let mut meta = call_meta(serde_json::json!({
            "task_count": accepted_count,
            "requested_task_count": requested_count,
            "accepted_task_count": accepted_count,
            "truncated_task_count": truncated_count,
            "accepted_tasks": accepted_tasks,
        }));
        meta["from_event_id"] = Value::from(from_event_id.clone());
        meta["from_event_resolution"] = to_value_or_null(from_event_resolution);
        meta
    };
    let call_event =
        deps.store
            .append_event(parent_worldline_id, EventType::ToolCallSubagents, &call_payload)?;
    signals.emit_event(parent_worldline_id, &call_event).await;

    let progress = Arc::new(ProgressTracker {
        signals: signals.clone(),
        parent_worldline_id: parent_worldline_id.to_string(),
        fanout_group_id: fanout_group_id.clone(),
        parent_tool_call_id: parent_tool_call_id.clone(),
        from_event_id: from_event_id.clone(),
        task_count: accepted_count,
        max_subagents: args.max_subagents,
        max_parallel_subagents: args.max_parallel_subagents,
        state: Mutex::new(ProgressState {
            statuses: HashMap::new(),
            seq: 0,
        }),
    });
    for run in &child_runs {
        progress
            .emit(run, "queued", "queued", Some(run.child_worldline_id.as_str()), "", None, None, 0, true)
            .await;
    }

    // Bounded parallel execution under the global deadline.
    let parallel_limit = args
        .max_parallel_subagents
        .min(deps.capacity.subagent_max_concurrency())
        .max(1);
    let parallel = Arc::new(tokio::sync::Semaphore::new(parallel_limit));
    let capacity_wait_ms = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(child_runs.len());
    for run in &child_runs {
        handles.push(tokio::spawn(run_one(
            deps.clone(),
            run.clone(),
            progress.clone(),
            parallel.clone(),
            capacity_wait_ms.clone(),
            args.max_iterations,
        )));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_s);
    let mut records = Vec::with_capacity(child_runs.len());
    for (run, mut handle) in child_runs.iter().zip(handles) {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(record)) => records.push(record),
            Ok(Err(join_err)) => {
                records.push(TaskRecord::failed(run, &join_err.to_string(), "subagent_error", 0));
            }
            Err(_) => {
                handle.abort();
                let record = TaskRecord::timeout(run, args.timeout_s, 0);
                progress
                    .emit(
                        run,
                        "timeout",
                        "finished",
                        Some(record.result_worldline_id.as_str()),
                        "",
                        record.error.as_deref(),
                        None,
                        0,
                        false,
                    )
                    .await;
                records.push(record);
            }
        }
    }

    // Fan-in aggregation, back in task-index order.
    records.sort_by_key(|record| record.task_index);
    let completed_count = records.iter().filter(|r| r.status == "completed").count();
    let timed_out_count = records.iter().filter(|r| r.status == "timeout").count();
    let failed_count = records.len() - completed_count - timed_out_count;
    let loop_limit_failure_count = records
        .iter()
        .filter(|r| r.failure_code.as_deref() == Some(LOOP_LIMIT_FAILURE_CODE))
        .count();
    let retried_count = records.iter().filter(|r| r.retry_count > 0).count();
    let recovered_count = records.iter().filter(|r| r.recovered).count();
    let mut failure_summary: HashMap<String, usize> = HashMap::new();
    for record in &records {
        if let Some(code) = record.failure_code.as_deref().filter(|c| !c.is_empty()) {
            *failure_summary.entry(code.to_string()).or_insert(0) += 1;
        }
    }
    let partial_failure = failed_count > 0 || timed_out_count > 0;

    let aggregate = serde_json::json!({
        "fanout_group_id": fanout_group_id,
        "parent_tool_call_id": parent_tool_call_id,
        "source_worldline_id": parent_worldline_id,
        "from_event_id": from_event_id,
        "task_count": accepted_count,
        "requested_task_count": requested_count,
        "accepted_task_count": accepted_count,
        "truncated_task_count": truncated_count,
        "accepted_tasks": accepted_tasks,
        "max_subagents": args.max_subagents,
        "max_parallel_subagents": args.max_parallel_subagents,
        "capacity_wait_ms": capacity_wait_ms.load(Ordering::Acquire),
        "completed_count": completed_count,
        "failed_count": failed_count,
        "timed_out_count": timed_out_count,
        "loop_limit_failure_count": loop_limit_failure_count,
        "retried_task_count": retried_count,
        "recovered_task_count": recovered_count,
        "failure_summary": failure_summary,
        "all_completed": !partial_failure,
        "partial_failure": partial_failure,
        "tasks": records,
    });

    let result_event = deps.store.append_and_advance(
        parent_worldline_id,
        Some(&call_event.id),
        EventType::ToolResultSubagents,
        &aggregate,
    )?;
    signals.emit_event(parent_worldline_id, &result_event).await;

    // Copy completed children's artifacts into the parent workspace.
    for record in &records {
        if record.status != "completed" {
            continue;
        }
        let artifacts = deps
            .store
            .artifacts_for_worldline(&record.result_worldline_id)
            .unwrap_or_default();
        if artifacts.is_empty() {
            continue;
        }
        if let Err(err) = artifact_merge::copy_artifacts_to_parent(
            &deps.store,
            &record.result_worldline_id,
            parent_worldline_id,
            &artifacts,
            &record.task_label,
            record.task_index,
            &result_event.id,
        ) {
            tracing::warn!(
                task_label = %record.task_label,
                error = %err,
                "artifact merge failed for completed subagent"
            );
        }
    }

    Ok(aggregate)
}

fn empty_prepared() -> Value {
    serde_json::json!({
        "task_count": 0,
        "requested_task_count": 0,
        "accepted_task_count": 0,
        "truncated_task_count": 0,
        "accepted_tasks": [],
    })
}

fn to_value_or_null(reason: Option<&'static str>) -> Value {
    reason.map(Value::from).unwrap_or(Value::Null)
}

/// Persist the call/result pair for a fan-out that failed before any
/// child ran, returning the error payload as the tool result.
async fn persist_failed_call(
    store: &MetaStore,
    parent_worldline_id: &str,
    call_payload: Value,
    error_payload: Value,
    signals: &TurnSignals,
) -> Result<Value> {
    let call_event =
        store.append_event(parent_worldline_id, EventType::ToolCallSubagents, &call_payload)?;
    signals.emit_event(parent_worldline_id, &call_event).await;
    let result_event = store.append_and_advance(
        parent_worldline_id,
        Some(&call_event.id),
        EventType::ToolResultSubagents,
        &error_payload,
    )?;
    signals.emit_event(parent_worldline_id, &result_event).await;
    Ok(error_payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wl_providers::scripted::ScriptedClient;
    use wl_providers::LlmResponse;

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_error("HTTP 429 Too Many Requests"));
        assert!(is_retryable_error("upstream 503"));
        assert!(is_retryable_error("Connection reset by peer"));
        assert!(is_retryable_error("request TIMEOUT"));
        assert!(is_retryable_error("service temporarily unavailable"));
        assert!(!is_retryable_error("syntax error at line 3"));
        assert!(!is_retryable_error(""));
    }

    #[test]
    fn fallback_split_shapes() {
        let tasks = fallback_task_split("analyze revenue  by region", 8);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].label, "schema-scout");
        assert!(tasks[1].message.contains("analyze revenue by region"));

        assert_eq!(fallback_task_split("goal", 1).len(), 1);
        assert!(fallback_task_split("   ", 8).is_empty());
    }

    #[tokio::test]
    async fn goal_split_parses_strict_json_and_falls_back() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(vec![LlmResponse::text_only(
            r#"{"tasks":[{"label":"a","message":"do a"},{"label":"b","message":"do b"}]}"#,
        )]));
        let tasks = derive_tasks_from_goal(&llm, "the goal", 8).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].label, "a");

        let llm: Arc<dyn LlmClient> =
            Arc::new(ScriptedClient::new(vec![LlmResponse::text_only("not json at all")]));
        let tasks = derive_tasks_from_goal(&llm, "the goal", 8).await;
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].label, "schema-scout");
    }

    #[tokio::test]
    async fn explicit_tasks_truncate_to_max() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(vec![]));
        let args = SpawnArgs {
            goal: None,
            tasks: Some(
                (0..5)
                    .map(|i| serde_json::json!({"message": format!("task {i}")}))
                    .collect(),
            ),
            from_event_id: None,
            timeout_s: 300,
            max_iterations: 8,
            max_subagents: 2,
            max_parallel_subagents: 3,
        };
        let (tasks, requested, truncated) = resolve_tasks(&llm, &args).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(requested, 5);
        assert_eq!(truncated, 3);
        assert_eq!(tasks[0].label, "task-1");
    }

    #[tokio::test]
    async fn empty_task_message_is_rejected() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(vec![]));
        let args = SpawnArgs {
            goal: None,
            tasks: Some(vec![serde_json::json!({"message": "  "})]),
            from_event_id: None,
            timeout_s: 300,
            max_iterations: 8,
            max_subagents: 8,
            max_parallel_subagents: 3,
        };
        let err = resolve_tasks(&llm, &args).await.unwrap_err();
        assert!(err.to_string().contains("task #1"));
    }

    #[test]
    fn fork_resolution_prefers_reachable_events() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::open(tmp.path()).unwrap();
        let thread = store.create_thread(None).unwrap();
        let wid = store.create_worldline(&thread.id, None).unwrap().id;
        let first = store
            .append_event(&wid, EventType::UserMessage, &serde_json::json!({"text": "one"}))
            .unwrap();
        let head = store
            .append_event(&wid, EventType::AssistantMessage, &serde_json::json!({"text": "two"}))
            .unwrap();

        // Empty request defaults to head.
        let (resolved, reason) = resolve_fork_event_id_or_head(&store, &wid, None).unwrap();
        assert_eq!(resolved, head.id);
        assert_eq!(reason, Some("defaulted_to_current_head"));

        // A historical ancestor is honored.
        let (resolved, reason) =
            resolve_fork_event_id_or_head(&store, &wid, Some(&first.id)).unwrap();
        assert_eq!(resolved, first.id);
        assert_eq!(reason, None);

        // Unknown events fall back to head with a reason.
        let (resolved, reason) =
            resolve_fork_event_id_or_head(&store, &wid, Some("event_ghost")).unwrap();
        assert_eq!(resolved, head.id);
        assert_eq!(reason, Some("requested_from_event_id_not_found_fell_back_to_head"));

        // Events on another worldline exist but are unreachable.
        let other = store.create_worldline(&thread.id, None).unwrap().id;
        let foreign = store
            .append_event(&other, EventType::UserMessage, &serde_json::json!({"text": "x"}))
            .unwrap();
        let (resolved, reason) =
            resolve_fork_event_id_or_head(&store, &wid, Some(&foreign.id)).unwrap();
        assert_eq!(resolved, head.id);
        assert_eq!(
            reason,
            Some("requested_from_event_id_not_in_history_fell_back_to_head")
        );
    }

    #[test]
    fn empty_timeline_is_a_caller_error() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::open(tmp.path()).unwrap();
        let thread = store.create_thread(None).unwrap();
        let wid = store.create_worldline(&thread.id, None).unwrap().id;
        let err = resolve_fork_event_id_or_head(&store, &wid, None).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn loop_limit_detection_from_text_and_trace() {
        let assistant = EventRecord {
            id: "event_a".into(),
            worldline_id: "worldline_w".into(),
            parent_event_id: None,
            event_type: EventType::AssistantMessage,
            payload: serde_json::json!({
                "text": "I reached the tool-loop limit before producing a final answer.",
            }),
            created_at: String::new(),
        };
        assert!(is_loop_limit_outcome(std::slice::from_ref(&assistant), None));

        let traced = EventRecord {
            payload: serde_json::json!({
                "text": "partial summary",
                "state_trace": [
                    {"from_state": "planning", "to_state": "error", "reason": "max_iterations_reached"},
                    {"from_state": "error", "to_state": "completed", "reason": "turn_finished"},
                ],
            }),
            ..assistant.clone()
        };
        let events = vec![traced];
        assert!(is_loop_limit_outcome(&events, Some("partial summary")));
        assert_eq!(
            terminal_reason_from_events(&events).as_deref(),
            Some(LOOP_LIMIT_REASON)
        );

        let clean = EventRecord {
            payload: serde_json::json!({
                "text": "all done",
                "state_trace": [
                    {"from_state": "planning", "to_state": "presenting", "reason": "assistant_text_ready"},
                    {"from_state": "presenting", "to_state": "completed", "reason": "turn_finished"},
                ],
            }),
            ..assistant
        };
        let events = vec![clean];
        assert!(!is_loop_limit_outcome(&events, Some("all done")));
        assert_eq!(terminal_reason_from_events(&events).as_deref(), Some("turn_finished"));
    }
}
