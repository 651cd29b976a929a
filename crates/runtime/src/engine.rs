//! The per-turn plan → tool → observe loop.
//!
//! One engine instance runs one turn: it appends the user message,
//! rebuilds the prompt from the event log each iteration (injecting the
//! artifact-inventory and data-checkpoint memory messages), asks the
//! LLM for the next step, dispatches tool calls in order, and
//! terminates on final text, a cap/duplicate stop, or the iteration
//! limit. A `time_travel` result rebinds the engine to the new
//! worldline for the rest of the turn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use wl_domain::event::EventType;
use wl_domain::turn::{StateTracker, TurnOutcome, TurnState, LOOP_LIMIT_REASON, LOOP_LIMIT_TEXT};
use wl_domain::{Error, Result};
use wl_providers::{GenerateRequest, LlmClient};
use wl_store::MetaStore;

use crate::artifact_memory;
use crate::data_intent;
use crate::dispatcher::{tool_definitions, DispatchContext, ToolDispatcher};
use crate::message_builder::build_llm_messages;
use crate::signals::TurnSignals;
use crate::toolargs::{self, canonical_signature};

const MAX_OUTPUT_TOKENS: u32 = 1500;

/// Per-turn tool-call caps.
fn max_calls_for(tool_name: &str) -> Option<u32> {
    match tool_name {
        toolargs::TOOL_RUN_SQL => Some(3),
        toolargs::TOOL_RUN_PYTHON => Some(3),
        toolargs::TOOL_TIME_TRAVEL => Some(1),
        toolargs::TOOL_SPAWN_SUBAGENTS => Some(1),
        _ => None,
    }
}

fn state_for_tool(tool_name: &str) -> (TurnState, &'static str) {
    match tool_name {
        toolargs::TOOL_RUN_PYTHON => (TurnState::Analyzing, "run_python_call"),
        toolargs::TOOL_SPAWN_SUBAGENTS => (TurnState::Analyzing, "spawn_subagents_call"),
        toolargs::TOOL_TIME_TRAVEL => (TurnState::DataFetching, "time_travel_call"),
        _ => (TurnState::DataFetching, "run_sql_call"),
    }
}

pub struct TurnEngine {
    store: Arc<MetaStore>,
    llm: Arc<dyn LlmClient>,
    dispatcher: ToolDispatcher,
    max_iterations: u32,
    model: Option<String>,
    /// Synthesis-only retries run with the tool set emptied.
    allow_tools: bool,
    subagent_depth: u32,
}

impl TurnEngine {
    pub fn new(
        store: Arc<MetaStore>,
        llm: Arc<dyn LlmClient>,
        dispatcher: ToolDispatcher,
        max_iterations: u32,
    ) -> Self {
        Self {
            store,
            llm,
            dispatcher,
            max_iterations: max_iterations.clamp(1, 100),
            model: None,
            allow_tools: true,
            subagent_depth: 0,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Engine for a subagent child turn: nested fan-outs are refused,
    /// and tools can be withheld entirely for synthesis-only retries.
    pub fn for_subagent(
        store: Arc<MetaStore>,
        llm: Arc<dyn LlmClient>,
        dispatcher: ToolDispatcher,
        max_iterations: u32,
        subagent_depth: u32,
        allow_tools: bool,
    ) -> Self {
        Self {
            store,
            llm,
            dispatcher,
            max_iterations: max_iterations.clamp(1, 100),
            model: None,
            allow_tools,
            subagent_depth,
        }
    }

    /// Run one turn. Returns the worldline the turn ended on (rebinding
    /// follows `time_travel`) and the events this turn appended there.
    pub async fn run_turn(
        &self,
        worldline_id: &str,
        message: &str,
        signals: &TurnSignals,
    ) -> Result<TurnOutcome> {
        if message.trim().is_empty() {
            return Err(Error::bad_request("message must not be empty"));
        }

        let mut active_worldline = worldline_id.to_string();
        let mut starting_rowids: HashMap<String, i64> = HashMap::new();
        starting_rowids.insert(active_worldline.clone(), self.store.max_rowid(&active_worldline)?);

        let user_event = self.store.append_event(
            &active_worldline,
            EventType::UserMessage,
            &serde_json::json!({"text": message}),
        )?;
        signals.emit_event(&active_worldline, &user_event).await;

        let mut tracker = StateTracker::new();
        let mut final_text: Option<String> = None;
        let mut successful_signatures: HashSet<String> = HashSet::new();
        let mut call_counts: HashMap<String, u32> = HashMap::new();
        let mut python_succeeded = false;

        'iterations: for iteration in 0..self.max_iterations {
            let history = self.store.rebuild_history(&active_worldline)?;
            let mut messages = build_llm_messages(&history);
            let inventory = artifact_memory::inventory_from_events(&history);
            artifact_memory::upsert_inventory_message(&mut messages, &inventory);
            let checkpoint = data_intent::summary_from_events(&history);
            data_intent::upsert_data_intent_message(&mut messages, checkpoint.as_ref());

            let tools = if self.allow_tools {
                tool_definitions(!python_succeeded, self.subagent_depth == 0)
            } else {
                Vec::new()
            };

            tracing::debug!(
                worldline_id = %active_worldline,
                iteration,
                message_count = messages.len(),
                "requesting next step"
            );
            let response = self
                .llm
                .generate(GenerateRequest {
                    messages,
                    tools,
                    max_output_tokens: Some(MAX_OUTPUT_TOKENS),
                    model: self.model.clone(),
                })
                .await?;

            if response.tool_calls.is_empty() {
                let text = if response.text.trim().is_empty() {
                    "Done.".to_string()
                } else {
                    response.text
                };
                tracker.transition(TurnState::Presenting, "assistant_text_ready");
                final_text = Some(text);
                break 'iterations;
            }

            // Plans carrying tool calls are persisted so prompt rebuilds
            // can fold them back into the assistant message.
            if !response.text.trim().is_empty() {
                let plan_event = self.store.append_event(
                    &active_worldline,
                    EventType::AssistantPlan,
                    &serde_json::json!({"text": response.text}),
                )?;
                signals.emit_event(&active_worldline, &plan_event).await;
            }

            for tool_call in &response.tool_calls {
                let tool_name = tool_call.tool_name.trim().to_string();

                if tool_name == toolargs::TOOL_RUN_PYTHON && python_succeeded {
                    tracker.transition(TurnState::Error, "python_rerun_blocked");
                    final_text = Some(
                        "Python already ran successfully in this turn, so I stopped additional Python executions and finalized the result."
                            .to_string(),
                    );
                    break 'iterations;
                }

                let count = call_counts.entry(tool_name.clone()).or_insert(0);
                *count += 1;
                if let Some(cap) = max_calls_for(&tool_name) {
                    if *count > cap {
                        tracker.transition(TurnState::Error, "tool_cap_exceeded");
                        final_text = Some(format!(
                            "I stopped because `{tool_name}` was called too many times in one turn. Please refine the request and try again."
                        ));
                        break 'iterations;
                    }
                }

                let normalized = toolargs::normalize_arguments(&tool_name, &tool_call.arguments);
                let signature = canonical_signature(&active_worldline, &tool_name, &normalized);
                if successful_signatures.contains(&signature) {
                    tracker.transition(TurnState::Error, "duplicate_tool_call");
                    final_text = Some(
                        "I stopped because the model repeated the same tool call with identical arguments in this turn."
                            .to_string(),
                    );
                    break 'iterations;
                }

                let (state, reason) = state_for_tool(&tool_name);
                tracker.transition(state, reason);

                let ctx = DispatchContext {
                    worldline_id: &active_worldline,
                    carried_user_message: message,
                    allowed_external_aliases: None,
                    subagent_depth: self.subagent_depth,
                };
                let (result, switched) = self
                    .dispatcher
                    .execute_tool_call(
                        &ctx,
                        &tool_name,
                        Some(tool_call.call_id.as_str()).filter(|s| !s.is_empty()),
                        &normalized,
                        signals,
                    )
                    .await?;

                if let Some(switched_worldline) = switched {
                    if switched_worldline != active_worldline {
                        tracing::info!(
                            from = %active_worldline,
                            to = %switched_worldline,
                            "turn rebound to branched worldline"
                        );
                        active_worldline = switched_worldline;
                        starting_rowids.entry(active_worldline.clone()).or_insert(0);
                    }
                }

                let errored = matches!(result.get("error"), Some(v) if !v.is_null());
                if !errored {
                    successful_signatures.insert(signature);
                    if tool_name == toolargs::TOOL_RUN_PYTHON {
                        python_succeeded = true;
                    }
                }
            }
        }

        let final_text = match final_text {
            Some(text) => text,
            None => {
                tracker.transition(TurnState::Error, LOOP_LIMIT_REASON);
                LOOP_LIMIT_TEXT.to_string()
            }
        };
        tracker.transition(TurnState::Completed, "turn_finished");

        let assistant_event = self.store.append_event(
            &active_worldline,
            EventType::AssistantMessage,
            &serde_json::json!({
                "text": final_text,
                "state_trace": tracker.trace_json(),
            }),
        )?;
        signals.emit_event(&active_worldline, &assistant_event).await;

        let starting_rowid = starting_rowids.get(&active_worldline).copied().unwrap_or(0);
        let events = self.store.events_since_rowid(&active_worldline, starting_rowid)?;
        Ok(TurnOutcome {
            worldline_id: active_worldline,
            events,
        })
    }
}
