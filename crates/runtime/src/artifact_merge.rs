//! Fan-in artifact merge: copy child-worldline artifacts into the
//! parent workspace under a label-derived prefix. Child rows are never
//! mutated; the parent gets fresh rows under the fan-in result event.

use serde_json::Value;
use wl_domain::worldline::ArtifactRecord;
use wl_domain::Result;
use wl_store::MetaStore;

/// Lowercase, collapse anything outside `[a-z0-9_-]` to `-`, trim
/// dashes, cap at 30 chars.
pub fn normalize_label(label: &str) -> String {
    let lowered = label.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            out.push(c);
            last_dash = c == '-';
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    trimmed.chars().take(30).collect()
}

/// Copy `artifacts` (rows of one child worldline) into the parent
/// workspace and register them under `target_event_id`. Returns a
/// summary per merged artifact.
pub fn copy_artifacts_to_parent(
    store: &MetaStore,
    source_worldline_id: &str,
    target_worldline_id: &str,
    artifacts: &[ArtifactRecord],
    task_label: &str,
    task_index: usize,
    target_event_id: &str,
) -> Result<Vec<Value>> {
    if artifacts.is_empty() {
        return Ok(Vec::new());
    }

    let datadb = store.datadb();
    let source_workspace = datadb.workspace_dir(source_worldline_id);
    let target_workspace = datadb.ensure_workspace(target_worldline_id)?;

    let mut prefix = normalize_label(task_label);
    if prefix.is_empty() {
        prefix = format!("task-{task_index}");
    }

    let mut merged = Vec::new();
    for artifact in artifacts {
        if artifact.name.trim().is_empty() || artifact.path.trim().is_empty() {
            continue;
        }

        let source_path = {
            let raw = std::path::Path::new(&artifact.path);
            if raw.is_absolute() {
                raw.to_path_buf()
            } else {
                source_workspace.join(raw)
            }
        };
        if !source_path.is_file() {
            tracing::warn!(path = %source_path.display(), "skipping artifact copy, source not found");
            continue;
        }

        let prefixed_name = format!("{prefix}_{}", artifact.name);
        let target_path = target_workspace.join(&prefixed_name);
        if let Err(err) = std::fs::copy(&source_path, &target_path) {
            tracing::warn!(name = %artifact.name, error = %err, "failed to copy artifact");
            continue;
        }

        let record = store.create_artifact(
            target_worldline_id,
            target_event_id,
            &artifact.artifact_type,
            &prefixed_name,
            &target_path.to_string_lossy(),
        )?;

        merged.push(serde_json::json!({
            "artifact_id": record.id,
            "name": prefixed_name,
            "type": artifact.artifact_type,
            "source_worldline_id": source_worldline_id,
            "source_name": artifact.name,
            "task_label": task_label,
            "task_index": task_index,
        }));
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wl_domain::event::EventType;

    #[test]
    fn label_normalization() {
        assert_eq!(normalize_label("Schema Scout"), "schema-scout");
        assert_eq!(normalize_label("  métrics / core!!  "), "m-trics-core");
        assert_eq!(normalize_label("ok_label-1"), "ok_label-1");
        assert_eq!(normalize_label("***"), "");
        let long = normalize_label(&"a".repeat(50));
        assert_eq!(long.len(), 30);
    }

    #[test]
    fn merge_copies_and_registers_with_prefix() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::open(tmp.path()).unwrap();
        let thread = store.create_thread(None).unwrap();
        let parent = store.create_worldline(&thread.id, None).unwrap().id;
        let child = store.create_worldline(&thread.id, Some("child")).unwrap().id;

        // A child artifact on disk plus its row.
        let child_workspace = store.datadb().ensure_workspace(&child).unwrap();
        let file = child_workspace.join("plot.png");
        std::fs::write(&file, b"png").unwrap();
        let child_event = store
            .append_event(&child, EventType::ToolResultPython, &serde_json::json!({}))
            .unwrap();
        store
            .create_artifact(&child, &child_event.id, "image", "plot.png", &file.to_string_lossy())
            .unwrap();

        let parent_event = store
            .append_event(&parent, EventType::ToolResultSubagents, &serde_json::json!({}))
            .unwrap();

        let artifacts = store.artifacts_for_worldline(&child).unwrap();
        let merged = copy_artifacts_to_parent(
            &store,
            &child,
            &parent,
            &artifacts,
            "Schema Scout",
            0,
            &parent_event.id,
        )
        .unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["name"], "schema-scout_plot.png");

        let parent_rows = store.artifacts_for_event(&parent_event.id).unwrap();
        assert_eq!(parent_rows.len(), 1);
        assert_eq!(parent_rows[0].name, "schema-scout_plot.png");
        assert!(std::path::Path::new(&parent_rows[0].path).exists());

        // Child rows untouched.
        assert_eq!(store.artifacts_for_worldline(&child).unwrap().len(), 1);
    }

    #[test]
    fn missing_sources_and_blank_labels_fall_back() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::open(tmp.path()).unwrap();
        let thread = store.create_thread(None).unwrap();
        let parent = store.create_worldline(&thread.id, None).unwrap().id;
        let child = store.create_worldline(&thread.id, None).unwrap().id;
        let child_workspace = store.datadb().ensure_workspace(&child).unwrap();
        std::fs::write(child_workspace.join("real.csv"), b"x").unwrap();

        let parent_event = store
            .append_event(&parent, EventType::ToolResultSubagents, &serde_json::json!({}))
            .unwrap();
        let child_event = store
            .append_event(&child, EventType::ToolResultPython, &serde_json::json!({}))
            .unwrap();
        store
            .create_artifact(&child, &child_event.id, "csv", "real.csv", "real.csv")
            .unwrap();
        store
            .create_artifact(&child, &child_event.id, "csv", "ghost.csv", "/nope/ghost.csv")
            .unwrap();

        let artifacts = store.artifacts_for_worldline(&child).unwrap();
        let merged = copy_artifacts_to_parent(
            &store, &child, &parent, &artifacts, "***", 2, &parent_event.id,
        )
        .unwrap();

        // Relative path resolves against the child workspace; the ghost
        // is skipped; the blank label falls back to task-<index>.
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["name"], "task-2_real.csv");
    }
}
