//! Derive proposed file changes from Phase 1 permission denials.

use serde_json::Value;

use crate::core::types::{ChangeTool, PermissionDenial, ProposedChange};

/// Keep write-class denials that name a file and map them to proposals.
///
/// Duplicates collapse onto the last denial for a path: the agent's final
/// intent for a file within one attempt supersedes earlier ones.
pub fn extract_proposed_changes(denials: &[PermissionDenial]) -> Vec<ProposedChange> {
    let changes = denials.iter().filter_map(change_from_denial).collect();
    dedup_by_path(changes)
}

fn change_from_denial(denial: &PermissionDenial) -> Option<ProposedChange> {
    let tool = ChangeTool::from_tool_name(&denial.tool_name)?;
    let input = &denial.tool_input;
    let file_path = string_field(input, "file_path")?;
    if file_path.trim().is_empty() {
        return None;
    }
    let change = match tool {
        ChangeTool::Write => ProposedChange {
            tool,
            file_path,
            content: string_field(input, "content"),
            old_text: None,
            new_text: None,
        },
        ChangeTool::Edit => ProposedChange {
            tool,
            file_path,
            content: None,
            old_text: string_field(input, "old_string"),
            new_text: string_field(input, "new_string"),
        },
    };
    Some(change)
}

fn string_field(input: &Value, key: &str) -> Option<String> {
    input.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Collapse proposals sharing a path onto the last one, ordered by that last occurrence.
pub fn dedup_by_path(changes: Vec<ProposedChange>) -> Vec<ProposedChange> {
    let mut kept: Vec<ProposedChange> = Vec::with_capacity(changes.len());
    for change in changes {
        kept.retain(|existing| existing.file_path != change.file_path);
        kept.push(change);
    }
    kept
}

/// Merge a later batch into an earlier one with the same last-writer-wins rule.
pub fn merge_changes(
    earlier: Vec<ProposedChange>,
    later: Vec<ProposedChange>,
) -> Vec<ProposedChange> {
    let mut all = earlier;
    all.extend(later);
    dedup_by_path(all)
}
