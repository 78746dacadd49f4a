//! Live output of agent activity while a phase runs.

use std::io::Write;

use serde_json::Value;
use tracing::debug;

/// Receives human-readable agent activity as it streams in.
///
/// The agent controller decides what is forwarded (thinking only when
/// verbose, full text only when no deltas were seen); sinks just render.
pub trait OutputSink {
    fn text(&mut self, text: &str);
    fn thinking(&mut self, text: &str);
    fn tool(&mut self, name: &str, detail: &str);
    /// The phase ended; terminate any partial line.
    fn finish(&mut self);
}

/// One-line description of a tool call for display.
pub fn describe_tool(name: &str, input: &Value) -> String {
    let key = match name {
        "Write" | "Edit" | "Read" | "MultiEdit" | "NotebookEdit" => "file_path",
        "Bash" => "command",
        "Grep" | "Glob" => "pattern",
        "WebFetch" => "url",
        _ => return String::new(),
    };
    input
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.lines().next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

/// Plain-text sink over any writer (stderr in the binary).
pub struct ConsoleSink<W: Write> {
    out: W,
    mid_line: bool,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(err) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            debug!(err = %err, "failed to write agent output");
        }
        self.mid_line = !text.ends_with('\n');
    }

    fn break_line(&mut self) {
        if self.mid_line {
            self.write("\n");
        }
    }
}

impl<W: Write> OutputSink for ConsoleSink<W> {
    fn text(&mut self, text: &str) {
        self.write(text);
    }

    fn thinking(&mut self, text: &str) {
        self.write(text);
    }

    fn tool(&mut self, name: &str, detail: &str) {
        self.break_line();
        if detail.is_empty() {
            self.write(&format!("[tool] {name}\n"));
        } else {
            self.write(&format!("[tool] {name} {detail}\n"));
        }
    }

    fn finish(&mut self) {
        self.break_line();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_lines_start_on_a_fresh_line() {
        let mut buf = Vec::new();
        {
            let mut sink = ConsoleSink::new(&mut buf);
            sink.text("Looking at the");
            sink.tool("Write", &describe_tool("Write", &json!({"file_path": "a.ts"})));
            sink.text("done");
            sink.finish();
        }
        assert_eq!(
            String::from_utf8(buf).expect("utf8"),
            "Looking at the\n[tool] Write a.ts\ndone\n"
        );
    }

    #[test]
    fn describe_tool_uses_first_command_line() {
        let detail = describe_tool("Bash", &json!({"command": "cargo test\necho done"}));
        assert_eq!(detail, "cargo test");
        assert_eq!(describe_tool("TodoWrite", &json!({})), "");
    }
}
