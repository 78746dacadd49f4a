//! Render proposed changes for operator review.

use similar::{ChangeTag, TextDiff};

use crate::core::types::{ChangeTool, ProposedChange};

/// Render every proposal as one review document.
pub fn render_changes(changes: &[ProposedChange]) -> String {
    let mut out = format!("Proposed changes ({}):\n", changes.len());
    for (idx, change) in changes.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!(
            "[{}] {} {}\n",
            idx + 1,
            change.tool.as_str(),
            change.file_path
        ));
        out.push_str(&render_change(change));
    }
    out
}

/// Full body for new files, a line diff for edits.
pub fn render_change(change: &ProposedChange) -> String {
    match change.tool {
        ChangeTool::Write => render_new_file(change.content.as_deref().unwrap_or_default()),
        ChangeTool::Edit => render_edit(
            &change.file_path,
            change.old_text.as_deref().unwrap_or_default(),
            change.new_text.as_deref().unwrap_or_default(),
        ),
    }
}

fn render_new_file(content: &str) -> String {
    let mut out = String::new();
    for line in content.lines() {
        out.push_str("+ ");
        out.push_str(line);
        out.push('\n');
    }
    if content.is_empty() {
        out.push_str("(empty file)\n");
    }
    out
}

fn render_edit(path: &str, old: &str, new: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut out = format!("--- {path}\n+++ {path}\n");
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "- ",
            ChangeTag::Insert => "+ ",
            ChangeTag::Equal => "  ",
        };
        out.push_str(sign);
        out.push_str(change.value().trim_end_matches('\n'));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_shows_removed_and_added_lines() {
        let change = ProposedChange {
            tool: ChangeTool::Edit,
            file_path: "src/a.rs".to_string(),
            content: None,
            old_text: Some("let x = 1;\nlet y = 2;".to_string()),
            new_text: Some("let x = 1;\nlet y = 3;".to_string()),
        };
        let rendered = render_change(&change);
        assert!(rendered.starts_with("--- src/a.rs\n+++ src/a.rs\n"));
        assert!(rendered.contains("  let x = 1;\n"));
        assert!(rendered.contains("- let y = 2;\n"));
        assert!(rendered.contains("+ let y = 3;\n"));
    }

    #[test]
    fn new_file_shows_full_content() {
        let change = ProposedChange {
            tool: ChangeTool::Write,
            file_path: "README.md".to_string(),
            content: Some("# Title\n\nbody\n".to_string()),
            old_text: None,
            new_text: None,
        };
        assert_eq!(render_change(&change), "+ # Title\n+ \n+ body\n");
    }

    #[test]
    fn review_document_numbers_each_change() {
        let changes = vec![
            ProposedChange {
                tool: ChangeTool::Write,
                file_path: "a.ts".to_string(),
                content: Some(String::new()),
                old_text: None,
                new_text: None,
            },
            ProposedChange {
                tool: ChangeTool::Edit,
                file_path: "b.ts".to_string(),
                content: None,
                old_text: Some("a".to_string()),
                new_text: Some("b".to_string()),
            },
        ];
        let doc = render_changes(&changes);
        assert!(doc.starts_with("Proposed changes (2):\n"));
        assert!(doc.contains("[1] Write a.ts\n(empty file)\n"));
        assert!(doc.contains("[2] Edit b.ts\n"));
    }
}
