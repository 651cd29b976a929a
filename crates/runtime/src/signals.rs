//! Advisory streaming channels.
//!
//! `on_event` carries persisted events as they append; `on_delta`
//! carries ephemeral progress frames (subagent status edges). Both are
//! telemetry only — durability is the event log, and send failures
//! (disconnected consumers) are ignored.

use tokio::sync::mpsc;
use wl_domain::event::EventRecord;

#[derive(Debug, Clone)]
pub enum TurnSignal {
    /// A persisted event, tagged with the worldline it landed on.
    Event {
        worldline_id: String,
        event: EventRecord,
    },
    /// An ephemeral progress frame.
    Delta {
        worldline_id: String,
        delta: serde_json::Value,
    },
}

/// Optional signal sender handed through the engine and tools.
#[derive(Debug, Clone, Default)]
pub struct TurnSignals {
    tx: Option<mpsc::Sender<TurnSignal>>,
}

impl TurnSignals {
    pub fn new(tx: mpsc::Sender<TurnSignal>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn emit_event(&self, worldline_id: &str, event: &EventRecord) {
        if let Some(tx) = &self.tx {
            let _ = tx
                .send(TurnSignal::Event {
                    worldline_id: worldline_id.to_string(),
                    event: event.clone(),
                })
                .await;
        }
    }

    pub async fn emit_delta(&self, worldline_id: &str, delta: serde_json::Value) {
        if let Some(tx) = &self.tx {
            let _ = tx
                .send(TurnSignal::Delta {
                    worldline_id: worldline_id.to_string(),
                    delta,
                })
                .await;
        }
    }
}
