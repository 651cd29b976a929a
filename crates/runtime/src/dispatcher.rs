//! Tool dispatch: route a normalized call to SQL, Python, time-travel,
//! or the subagent coordinator, and reify tool-level failures into the
//! result payload. Only store-level failures (missing rows, head
//! conflicts, IO) propagate as the turn's failure.

use std::sync::Arc;

use serde_json::{Map, Value};
use wl_domain::tool::ToolDefinition;
use wl_domain::worldline::BranchOptions;
use wl_domain::{Error, Result};
use wl_providers::LlmClient;
use wl_sandbox::SandboxManager;
use wl_store::MetaStore;

use crate::capacity::CapacityController;
use crate::coordinator::TurnCoordinator;
use crate::python_tool::{execute_python_tool, PythonToolRequest};
use crate::signals::TurnSignals;
use crate::sql_tool::{execute_sql_tool, SqlToolRequest};
use crate::subagents;
use crate::toolargs::{typed_call, NormalizedCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call context carried from the engine.
pub struct DispatchContext<'a> {
    pub worldline_id: &'a str,
    /// The turn's user message, carried into branch prologues.
    pub carried_user_message: &'a str,
    pub allowed_external_aliases: Option<&'a [String]>,
    /// Depth 0 is a top-level turn; children may not nest fan-outs.
    pub subagent_depth: u32,
}

/// Clonable bundle of the tool-execution dependencies.
#[derive(Clone)]
pub struct ToolDispatcher {
    store: Arc<MetaStore>,
    sandboxes: Arc<SandboxManager>,
    capacity: Arc<CapacityController>,
    coordinator: TurnCoordinator,
    llm: Arc<dyn LlmClient>,
}

impl ToolDispatcher {
    pub fn new(
        store: Arc<MetaStore>,
        sandboxes: Arc<SandboxManager>,
        capacity: Arc<CapacityController>,
        coordinator: TurnCoordinator,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            sandboxes,
            capacity,
            coordinator,
            llm,
        }
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn capacity(&self) -> &Arc<CapacityController> {
        &self.capacity
    }

    pub fn coordinator(&self) -> &TurnCoordinator {
        &self.coordinator
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    /// Execute one normalized tool call. Returns the result payload and,
    /// for `time_travel`, the worldline the engine must rebind to.
    pub async fn execute_tool_call(
        &self,
        ctx: &DispatchContext<'_>,
        tool_name: &str,
        call_id: Option<&str>,
        arguments: &Map<String, Value>,
        signals: &TurnSignals,
    ) -> Result<(Value, Option<String>)> {
        let call = match typed_call(tool_name, arguments) {
            Ok(call) => call,
            Err(Error::BadRequest(message)) => {
                return Ok((serde_json::json!({"error": message}), None));
            }
            Err(err) => return Err(err),
        };

        match call {
            NormalizedCall::Sql { sql, limit } => {
                let request = SqlToolRequest {
                    worldline_id: ctx.worldline_id.to_string(),
                    sql,
                    limit,
                    allowed_external_aliases: ctx.allowed_external_aliases.map(<[String]>::to_vec),
                    call_id: call_id.map(str::to_string),
                };
                match execute_sql_tool(&self.store, &request, signals).await {
                    Ok(payload) => Ok((payload, None)),
                    Err(err) => reify_or_raise(err),
                }
            }
            NormalizedCall::Python { code, timeout } => {
                let request = PythonToolRequest {
                    worldline_id: ctx.worldline_id.to_string(),
                    code,
                    timeout,
                    call_id: call_id.map(str::to_string),
                };
                match execute_python_tool(&self.store, &self.sandboxes, &self.capacity, &request, signals)
                    .await
                {
                    Ok(payload) => Ok((payload, None)),
                    Err(err) => reify_or_raise(err),
                }
            }
            NormalizedCall::TimeTravel {
                from_event_id,
                name,
            } => {
                let options = BranchOptions {
                    source_worldline_id: ctx.worldline_id.to_string(),
                    from_event_id,
                    name,
                    append_events: true,
                    carried_user_message: Some(ctx.carried_user_message.to_string()),
                };
                match self.store.branch_from_event(&options) {
                    Ok(branch) => {
                        for event_id in &branch.created_event_ids {
                            if let Ok(event) = self.store.event(event_id) {
                                signals.emit_event(&branch.new_worldline_id, &event).await;
                            }
                        }
                        let switched = branch.new_worldline_id.clone();
                        Ok((branch.to_tool_result(), Some(switched)))
                    }
                    Err(err) => reify_or_raise(err),
                }
            }
            NormalizedCall::SpawnSubagents(args) => {
                if ctx.subagent_depth > 0 {
                    return Ok((
                        serde_json::json!({
                            "error": "spawn_subagents is disabled for subagent child turns",
                            "error_code": "spawn_subagents_nested_not_allowed",
                        }),
                        None,
                    ));
                }
                let payload = subagents::run_spawn_subagents(
                    self,
                    ctx.worldline_id,
                    call_id.map(str::to_string),
                    args,
                    signals,
                )
                .await?;
                Ok((payload, None))
            }
        }
    }
}

/// Tool-level failures become observable results; store/engine failures
/// surface as the turn's failure.
fn reify_or_raise(err: Error) -> Result<(Value, Option<String>)> {
    match err {
        Error::BadRequest(message) => Ok((serde_json::json!({"error": message}), None)),
        Error::NotFound(message) => Ok((serde_json::json!({"error": message}), None)),
        err @ (Error::HeadConflict(_)
        | Error::Sqlite(_)
        | Error::Io(_)
        | Error::Json(_)
        | Error::Shutdown(_)) => Err(err),
        other => Ok((serde_json::json!({"error": other.to_string()}), None)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the tool set offered to the LLM for one iteration.
/// `include_python` drops after the first successful python run in a
/// turn; `include_subagents` is off for child turns.
pub fn tool_definitions(include_python: bool, include_subagents: bool) -> Vec<ToolDefinition> {
    let mut defs = vec![ToolDefinition {
        name: "run_sql".into(),
        description: "Execute a read-only SQL query against the worldline's analytical database. Use for table reads and aggregations.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "sql": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "maximum": 10000},
            },
            "required": ["sql"],
            "additionalProperties": false,
        }),
    }];

    if include_subagents {
        defs.push(ToolDefinition {
            name: "spawn_subagents".into(),
            description: "Fan out parallel child investigations by branching worldlines from a prior event. Prefer passing `goal` and let the system split work into tasks automatically; optionally pass explicit `tasks`. The parent turn blocks until child worldlines finish, then returns aggregated results.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "goal": {"type": "string"},
                    "tasks": {
                        "type": "array",
                        "minItems": 1,
                        "maxItems": 50,
                        "items": {
                            "type": "object",
                            "properties": {
                                "message": {"type": "string"},
                                "label": {"type": "string"},
                                "branch_name": {"type": "string"},
                            },
                            "required": ["message"],
                            "additionalProperties": false,
                        },
                    },
                    "from_event_id": {"type": "string"},
                    "timeout_s": {"type": "integer", "minimum": 1, "maximum": 1800},
                    "max_iterations": {"type": "integer", "minimum": 1, "maximum": 100},
                    "max_subagents": {"type": "integer", "minimum": 1, "maximum": 50},
                    "max_parallel_subagents": {"type": "integer", "minimum": 1, "maximum": 10},
                },
                "anyOf": [{"required": ["goal"]}, {"required": ["tasks"]}],
                "additionalProperties": false,
            }),
        });
    }

    if include_python {
        defs.insert(1, ToolDefinition {
            name: "run_python".into(),
            description: "Execute Python in the sandbox workspace for this worldline. Use for plotting, data manipulation, and file artifacts. For plots: use matplotlib (plt.plot, plt.bar, etc.) and call plt.savefig('artifacts/plot.png') before plt.show() to persist the image.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "timeout": {"type": "integer", "minimum": 1, "maximum": 120},
                },
                "required": ["code"],
                "additionalProperties": false,
            }),
        });
    }

    defs.push(ToolDefinition {
        name: "time_travel".into(),
        description: "Create a new worldline from a prior event and continue execution there.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "from_event_id": {"type": "string"},
                "name": {"type": "string"},
            },
            "required": ["from_event_id"],
            "additionalProperties": false,
        }),
    });

    defs
}
