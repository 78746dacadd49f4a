//! Scripted fakes for exercising the orchestrator without a real agent or terminal.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::stream::StreamParser;
use crate::core::types::{SessionPolicy, Termination};
use crate::io::agent::{AgentBackend, AgentMode, AgentRequest, AgentRun, StreamCollector};
use crate::io::cancel::CancelToken;
use crate::io::config::{OrchestratorConfig, write_config};
use crate::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use crate::io::operator::Operator;
use crate::io::sink::OutputSink;

/// Temporary project root with an initialized `.orchestrator/`.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp project")?;
        init_orchestrator(dir.path(), &InitOptions { force: false })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> OrchestratorPaths {
        OrchestratorPaths::new(self.dir.path())
    }

    /// Write an `sh` script that stands in for the agent binary.
    pub fn write_agent_script(&self, body: &str) -> Result<PathBuf> {
        let path = self.paths().dir.join("fake-agent.sh");
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Configure the project to run `sh <script>` as its agent.
    pub fn use_agent_script(&self, body: &str, phase_timeout_secs: u64) -> Result<PathBuf> {
        let script = self.write_agent_script(body)?;
        let mut cfg = OrchestratorConfig::default();
        cfg.agent.binary = "sh".to_string();
        cfg.agent.extra_args = vec![script.display().to_string()];
        cfg.agent.phase_timeout_secs = phase_timeout_secs;
        write_config(&self.paths().config_path, &cfg)?;
        Ok(script)
    }
}

/// One scripted operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Choose(usize),
    Text(String),
    Interrupt,
}

/// Operator that replays replies in order and records what it was shown.
///
/// Panics when asked more questions than scripted, so tests also assert
/// that no unexpected prompt happened.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    replies: VecDeque<Reply>,
    pub shown: Vec<String>,
    pub questions: Vec<String>,
}

impl ScriptedOperator {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn remaining(&self) -> usize {
        self.replies.len()
    }

    fn next(&mut self, question: &str) -> Reply {
        self.questions.push(question.to_string());
        match self.replies.pop_front() {
            Some(reply) => reply,
            None => panic!("unscripted operator question: {question}"),
        }
    }
}

impl Operator for ScriptedOperator {
    fn show(&mut self, text: &str) {
        self.shown.push(text.to_string());
    }

    fn choose(&mut self, question: &str, options: &[&str]) -> Option<usize> {
        match self.next(question) {
            Reply::Choose(idx) => {
                assert!(idx < options.len(), "choice {idx} out of range for {question}");
                Some(idx)
            }
            Reply::Interrupt => None,
            Reply::Text(text) => panic!("expected a choice for {question}, got text {text:?}"),
        }
    }

    fn ask_text(&mut self, question: &str) -> Option<String> {
        match self.next(question) {
            Reply::Text(text) => Some(text),
            Reply::Interrupt => None,
            Reply::Choose(idx) => panic!("expected text for {question}, got choice {idx}"),
        }
    }
}

/// Sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub text: String,
    pub thinking: String,
    pub tools: Vec<(String, String)>,
    pub finished: u32,
}

impl OutputSink for RecordingSink {
    fn text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    fn thinking(&mut self, text: &str) {
        self.thinking.push_str(text);
    }

    fn tool(&mut self, name: &str, detail: &str) {
        self.tools.push((name.to_string(), detail.to_string()));
    }

    fn finish(&mut self) {
        self.finished += 1;
    }
}

/// Stream records an agent invocation replays, and how it ends.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub lines: Vec<Value>,
    pub termination: Termination,
}

impl ScriptedRun {
    pub fn completed(lines: Vec<Value>) -> Self {
        Self {
            lines,
            termination: Termination::Completed { exit_code: Some(0) },
        }
    }

    pub fn ended(lines: Vec<Value>, termination: Termination) -> Self {
        Self { lines, termination }
    }
}

/// Agent backend that replays scripted runs in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    runs: RefCell<VecDeque<ScriptedRun>>,
    pub requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into_iter().collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Number of Phase 1 (analyze) invocations seen so far.
    pub fn analyze_calls(&self) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.mode == AgentMode::Analyze)
            .count()
    }

    pub fn request(&self, idx: usize) -> AgentRequest {
        self.requests.borrow()[idx].clone()
    }
}

impl AgentBackend for ScriptedAgent {
    fn run(
        &self,
        request: &AgentRequest,
        sink: &mut dyn OutputSink,
        policy: SessionPolicy,
        cancel: &CancelToken,
    ) -> AgentRun {
        if cancel.is_cancelled() {
            return AgentRun::synthetic(Termination::Cancelled);
        }
        self.requests.borrow_mut().push(request.clone());
        let run = match self.runs.borrow_mut().pop_front() {
            Some(run) => run,
            None => panic!("agent invoked more times than scripted ({:?})", request.mode),
        };

        let mut transcript = String::new();
        let mut parser = StreamParser::new();
        let mut collector = StreamCollector::new(policy.verbose);
        for line in &run.lines {
            let raw = format!("{line}\n");
            transcript.push_str(&raw);
            for event in parser.feed(raw.as_bytes()) {
                collector.observe(event, sink);
            }
        }
        if let Some(path) = &request.transcript_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("create transcript dir");
            }
            fs::write(path, transcript).expect("write transcript");
        }
        if run.termination == Termination::Cancelled {
            cancel.cancel();
        }
        sink.finish();
        collector.into_run(run.termination)
    }
}

/// `result` record closing a run.
pub fn result_line(session_id: &str, result: &str, denials: Vec<Value>) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "session_id": session_id,
        "result": result,
        "is_error": false,
        "permission_denials": denials,
    })
}

pub fn write_denial(path: &str, content: &str) -> Value {
    json!({
        "tool_name": "Write",
        "tool_use_id": format!("deny-{path}"),
        "tool_input": {"file_path": path, "content": content},
    })
}

pub fn edit_denial(path: &str, old: &str, new: &str) -> Value {
    json!({
        "tool_name": "Edit",
        "tool_use_id": format!("deny-{path}"),
        "tool_input": {"file_path": path, "old_string": old, "new_string": new},
    })
}

pub fn text_delta(text: &str) -> Value {
    json!({
        "type": "stream_event",
        "event": {"type": "content_block_delta", "index": 0,
                  "delta": {"type": "text_delta", "text": text}},
    })
}

/// Phase 1 run proposing one `Write` per path.
pub fn proposing(session_id: &str, paths: &[&str]) -> ScriptedRun {
    let denials = paths
        .iter()
        .map(|path| write_denial(path, &format!("// {path}\n")))
        .collect();
    ScriptedRun::completed(vec![
        text_delta("Proposing changes."),
        result_line(session_id, "I want to write files.", denials),
    ])
}

/// Phase 1 run that needs no changes.
pub fn no_changes(session_id: &str, response: &str) -> ScriptedRun {
    ScriptedRun::completed(vec![result_line(session_id, response, Vec::new())])
}

/// Tool use + successful tool result records for one file write.
pub fn applied_write(id: &str, path: &str) -> Vec<Value> {
    vec![
        json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": id, "name": "Write",
             "input": {"file_path": path, "content": "applied"}}]}}),
        json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": id, "is_error": false}]}}),
    ]
}

/// Phase 2 run that writes every path and finishes.
pub fn applying(session_id: &str, paths: &[&str]) -> ScriptedRun {
    let mut lines: Vec<Value> = paths
        .iter()
        .enumerate()
        .flat_map(|(idx, path)| applied_write(&format!("apply-{idx}"), path))
        .collect();
    lines.push(result_line(session_id, "Applied.", Vec::new()));
    ScriptedRun::completed(lines)
}
