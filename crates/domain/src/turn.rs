//! The per-turn state machine and turn outcome types.
//!
//! States track where a turn is in its plan → fetch → analyze → present
//! loop. Invalid transitions route to `error` rather than panicking; the
//! full trace is persisted on the terminal assistant event so downstream
//! consumers (subagent retry logic in particular) can inspect how the
//! turn ended.

use serde::{Deserialize, Serialize};

use crate::event::EventRecord;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Planning,
    SemanticShortcut,
    DataFetching,
    Analyzing,
    Presenting,
    Error,
    Completed,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::SemanticShortcut => "semantic_shortcut",
            Self::DataFetching => "data_fetching",
            Self::Analyzing => "analyzing",
            Self::Presenting => "presenting",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }

    fn allowed_targets(self) -> &'static [TurnState] {
        use TurnState::*;
        match self {
            Planning => &[SemanticShortcut, DataFetching, Analyzing, Presenting, Completed, Error],
            SemanticShortcut => &[Presenting, Completed, Error],
            DataFetching => &[Analyzing, Presenting, Error, Completed],
            Analyzing => &[DataFetching, Presenting, Error, Completed],
            Presenting => &[Analyzing, Error, Completed],
            Error => &[Planning, Completed],
            Completed => &[],
        }
    }
}

/// One recorded transition; serialized into the assistant event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTraceEntry {
    pub from_state: String,
    pub to_state: String,
    pub reason: String,
}

/// Tracks the current state and the transition trace for one turn.
#[derive(Debug, Default)]
pub struct StateTracker {
    state: TurnState,
    trace: Vec<StateTraceEntry>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self::Planning
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn trace(&self) -> &[StateTraceEntry] {
        &self.trace
    }

    /// Attempt a transition. A disallowed target routes the turn to
    /// `error` and records an `invalid_transition` trace entry.
    pub fn transition(&mut self, to: TurnState, reason: &str) -> TurnState {
        if self.state == to {
            return self.state;
        }

        if !self.state.allowed_targets().contains(&to) {
            tracing::warn!(
                from = self.state.as_str(),
                to = to.as_str(),
                reason,
                "invalid turn state transition"
            );
            self.trace.push(StateTraceEntry {
                from_state: self.state.as_str().into(),
                to_state: TurnState::Error.as_str().into(),
                reason: format!(
                    "invalid_transition:{}->{}:{reason}",
                    self.state.as_str(),
                    to.as_str()
                ),
            });
            self.state = TurnState::Error;
            return self.state;
        }

        self.trace.push(StateTraceEntry {
            from_state: self.state.as_str().into(),
            to_state: to.as_str().into(),
            reason: reason.into(),
        });
        self.state = to;
        self.state
    }

    pub fn trace_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.trace).unwrap_or_else(|_| serde_json::Value::Array(vec![]))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Marker text of the loop-limit terminal assistant message.
pub const LOOP_LIMIT_TEXT: &str =
    "I reached the tool-loop limit before producing a final answer.";

/// State-trace reason recorded when a turn hits its iteration cap.
pub const LOOP_LIMIT_REASON: &str = "max_iterations_reached";

/// Result of one executed turn: the worldline the turn ended on (it may
/// differ from the input after a `time_travel`) and the events this turn
/// appended, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub worldline_id: String,
    pub events: Vec<EventRecord>,
}
