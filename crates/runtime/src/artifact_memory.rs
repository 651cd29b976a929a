//! The artifact-inventory memory message.
//!
//! An always-on system message listing every artifact on the worldline
//! (deduped by name, newest wins, capped) so the model reuses files
//! instead of regenerating them.

use serde::Serialize;
use serde_json::Value;
use wl_domain::event::{EventRecord, EventType};
use wl_domain::tool::ChatMessage;

pub const ARTIFACT_INVENTORY_HEADER: &str = "Artifact inventory for this worldline";
pub const ARTIFACT_INVENTORY_MAX_ITEMS: usize = 40;

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInventoryEntry {
    pub artifact_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_call_id: Option<String>,
    pub source_event_id: String,
    pub producer: &'static str,
}

/// Collect the inventory from a chronological event slice: every
/// artifact announced by a `tool_result_python`, deduped by lowercase
/// name with the latest occurrence winning.
pub fn inventory_from_events(events: &[EventRecord]) -> Vec<ArtifactInventoryEntry> {
    // Latest-wins dedup that preserves recency order: keep a vec and
    // drop earlier entries with the same key.
    let mut inventory: Vec<(String, ArtifactInventoryEntry)> = Vec::new();

    for event in events {
        if event.event_type != EventType::ToolResultPython {
            continue;
        }
        let artifacts = match event.payload.get("artifacts").and_then(Value::as_array) {
            Some(artifacts) => artifacts,
            None => continue,
        };

        let source_call_id = event
            .parent_event_id
            .as_ref()
            .and_then(|parent_id| events.iter().find(|e| e.id == *parent_id))
            .and_then(|parent| parent.payload.get("call_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        for artifact in artifacts {
            let name = artifact
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if name.is_empty() {
                continue;
            }
            let key = name.to_lowercase();
            inventory.retain(|(existing, _)| existing != &key);
            inventory.push((
                key,
                ArtifactInventoryEntry {
                    artifact_id: artifact
                        .get("artifact_id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    name: name.to_string(),
                    artifact_type: artifact
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("file")
                        .to_string(),
                    created_at: event.created_at.clone(),
                    source_call_id: source_call_id.clone(),
                    source_event_id: event.id.clone(),
                    producer: "run_python",
                },
            ));
        }
    }

    let mut entries: Vec<ArtifactInventoryEntry> =
        inventory.into_iter().map(|(_, entry)| entry).collect();
    if entries.len() > ARTIFACT_INVENTORY_MAX_ITEMS {
        entries.drain(..entries.len() - ARTIFACT_INVENTORY_MAX_ITEMS);
    }
    entries
}

fn render(inventory: &[ArtifactInventoryEntry]) -> String {
    let payload = serde_json::json!({
        "artifact_count": inventory.len(),
        "artifacts": inventory,
        "instructions": "Check this inventory before creating files. Reuse existing artifacts instead of regenerating identical outputs.",
    });
    format!("{ARTIFACT_INVENTORY_HEADER} (always-on memory):\n{payload}")
}

/// Insert (or replace) the inventory message right after the system
/// prompt.
pub fn upsert_inventory_message(messages: &mut Vec<ChatMessage>, inventory: &[ArtifactInventoryEntry]) {
    let memory = ChatMessage::system(render(inventory));
    for message in messages.iter_mut() {
        if message.role == wl_domain::tool::Role::System
            && message.content.starts_with(ARTIFACT_INVENTORY_HEADER)
        {
            *message = memory;
            return;
        }
    }
    let index = if messages.is_empty() { 0 } else { 1 };
    messages.insert(index, memory);
}
