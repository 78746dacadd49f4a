//! Agent process controller.
//!
//! The [`AgentBackend`] trait decouples the two-phase controller from the
//! actual agent binary (the `claude` CLI). Tests use scripted backends that
//! replay stream records without spawning processes.
//!
//! A run never returns an error: spawn failures, timeouts, and cancellation
//! are folded into [`AgentRun::termination`] so callers always get whatever
//! partial output was collected.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::proposals::{extract_proposed_changes, merge_changes};
use crate::core::stream::{StreamEvent, StreamParser};
use crate::core::types::{
    ChangeTool, PermissionDenial, PhaseOneOutcome, ProposedChange, SessionPolicy, Termination,
};
use crate::io::cancel::CancelToken;
use crate::io::process::capture;
use crate::io::sink::{OutputSink, describe_tool};

/// Fixed directive sent when resuming a session to apply approved changes.
pub const PROCEED_DIRECTIVE: &str = "Proceed with the approved changes.";

/// Default per-phase wall-clock limit.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMode {
    /// Phase 1: default permissions, so file writes are denied and reported.
    Analyze,
    /// Phase 2: resume the Phase 1 session with edits auto-accepted.
    Apply { session_id: String },
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workdir: PathBuf,
    /// Text written to the agent's stdin.
    pub input: String,
    pub mode: AgentMode,
    pub timeout: Duration,
    /// Raw stdout is copied here as it arrives, when set.
    pub transcript_path: Option<PathBuf>,
    /// Bound on captured stderr.
    pub output_limit_bytes: usize,
}

/// Everything observed during one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRun {
    pub session_id: Option<String>,
    pub response_text: String,
    pub thinking_text: String,
    pub denials: Vec<PermissionDenial>,
    /// Proposals across every result record, last write per path.
    pub proposed_changes: Vec<ProposedChange>,
    /// Whether a final result record arrived.
    pub finished: bool,
    pub is_error: bool,
    /// Paths whose `Write`/`Edit` tool use got a successful tool result.
    pub confirmed_paths: Vec<String>,
    pub termination: Termination,
}

impl AgentRun {
    /// Outcome for an invocation that never produced output.
    pub fn synthetic(termination: Termination) -> Self {
        Self {
            session_id: None,
            response_text: String::new(),
            thinking_text: String::new(),
            denials: Vec::new(),
            proposed_changes: Vec::new(),
            finished: false,
            is_error: false,
            confirmed_paths: Vec::new(),
            termination,
        }
    }

    /// View this run as a Phase 1 analysis result.
    pub fn phase_one_outcome(&self) -> PhaseOneOutcome {
        PhaseOneOutcome {
            session_id: self.session_id.clone(),
            response_text: self.response_text.clone(),
            proposed_changes: self.proposed_changes.clone(),
            has_denials: !self.denials.is_empty(),
            termination: self.termination.clone(),
        }
    }
}

/// Abstraction over agent backends.
pub trait AgentBackend {
    fn run(
        &self,
        request: &AgentRequest,
        sink: &mut dyn OutputSink,
        policy: SessionPolicy,
        cancel: &CancelToken,
    ) -> AgentRun;
}

/// Folds stream events into an [`AgentRun`] and forwards live output.
#[derive(Debug, Default)]
pub struct StreamCollector {
    verbose: bool,
    delta_text: String,
    last_text: Option<String>,
    delta_thinking: String,
    last_thinking: Option<String>,
    saw_text_delta: bool,
    saw_thinking_delta: bool,
    tool_names: HashMap<String, String>,
    announced: HashSet<String>,
    write_targets: HashMap<String, String>,
    confirmed: Vec<String>,
    session_id: Option<String>,
    result_text: Option<String>,
    denials: Vec<PermissionDenial>,
    proposed: Vec<ProposedChange>,
    is_error: bool,
}

impl StreamCollector {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    pub fn observe(&mut self, event: StreamEvent, sink: &mut dyn OutputSink) {
        match event {
            StreamEvent::AssistantTextDelta(text) => {
                self.saw_text_delta = true;
                sink.text(&text);
                self.delta_text.push_str(&text);
            }
            StreamEvent::AssistantThinkingDelta(text) => {
                self.saw_thinking_delta = true;
                if self.verbose {
                    sink.thinking(&text);
                }
                self.delta_thinking.push_str(&text);
            }
            StreamEvent::AssistantText(text) => {
                if !self.saw_text_delta {
                    sink.text(&text);
                    sink.text("\n");
                }
                self.last_text = Some(text);
            }
            StreamEvent::AssistantThinking(text) => {
                if self.verbose && !self.saw_thinking_delta {
                    sink.thinking(&text);
                    sink.thinking("\n");
                }
                self.last_thinking = Some(text);
            }
            StreamEvent::ToolInvocationStarted { id, name, input } => {
                self.tool_started(id, name, &input, sink);
            }
            StreamEvent::ToolInvocationEnded {
                tool_use_id: Some(id),
                is_error,
            } => self.tool_ended(&id, is_error, sink),
            StreamEvent::ToolInvocationEnded {
                tool_use_id: None, ..
            } => {}
            StreamEvent::FinalResult {
                session_id,
                result,
                permission_denials,
                is_error,
            } => {
                debug!(
                    session_id = ?session_id,
                    denials = permission_denials.len(),
                    is_error,
                    "agent final result"
                );
                let batch = extract_proposed_changes(&permission_denials);
                self.proposed = merge_changes(std::mem::take(&mut self.proposed), batch);
                self.denials.extend(permission_denials);
                self.session_id = session_id.or(self.session_id.take());
                self.result_text = Some(result);
                self.is_error = is_error;
            }
            StreamEvent::Unknown(kind) => debug!(kind, "ignoring stream record"),
        }
    }

    fn tool_started(
        &mut self,
        id: Option<String>,
        name: String,
        input: &Value,
        sink: &mut dyn OutputSink,
    ) {
        let has_input = input.as_object().is_some_and(|obj| !obj.is_empty());
        let Some(id) = id else {
            if has_input {
                sink.tool(&name, &describe_tool(&name, input));
            }
            return;
        };
        if ChangeTool::from_tool_name(&name).is_some()
            && let Some(path) = input.get("file_path").and_then(Value::as_str)
        {
            self.write_targets.insert(id.clone(), path.to_string());
        }
        // Partial messages announce the block before its input is known.
        if has_input && self.announced.insert(id.clone()) {
            sink.tool(&name, &describe_tool(&name, input));
        }
        self.tool_names.insert(id, name);
    }

    fn tool_ended(&mut self, id: &str, is_error: bool, sink: &mut dyn OutputSink) {
        if !self.announced.contains(id)
            && let Some(name) = self.tool_names.get(id)
        {
            sink.tool(name, "");
            self.announced.insert(id.to_string());
        }
        if is_error {
            return;
        }
        if let Some(path) = self.write_targets.get(id)
            && !self.confirmed.contains(path)
        {
            self.confirmed.push(path.clone());
        }
    }

    pub fn into_run(self, termination: Termination) -> AgentRun {
        let finished = self.result_text.is_some();
        let response_text = self
            .result_text
            .filter(|text| !text.trim().is_empty())
            .or(self.last_text)
            .unwrap_or(self.delta_text);
        let thinking_text = self.last_thinking.unwrap_or(self.delta_thinking);
        AgentRun {
            session_id: self.session_id,
            response_text,
            thinking_text,
            denials: self.denials,
            proposed_changes: self.proposed,
            finished,
            is_error: self.is_error,
            confirmed_paths: self.confirmed,
            termination,
        }
    }
}

/// Backend that spawns the `claude` CLI in print mode with `stream-json` output.
#[derive(Debug, Clone)]
pub struct ClaudeCliAgent {
    pub binary: String,
    /// Inserted before the mode flags (e.g. a script path when `binary` is a shell).
    pub extra_args: Vec<String>,
    pub model: Option<String>,
}

impl ClaudeCliAgent {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            model: None,
        }
    }

    /// Arguments after the binary for the given mode.
    pub fn args(&self, mode: &AgentMode) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push("-p".to_string());
        match mode {
            AgentMode::Analyze => {
                args.extend(
                    [
                        "--output-format",
                        "stream-json",
                        "--verbose",
                        "--include-partial-messages",
                        "--permission-mode",
                        "default",
                    ]
                    .map(str::to_string),
                );
            }
            AgentMode::Apply { session_id } => {
                args.push("--resume".to_string());
                args.push(session_id.clone());
                args.extend(
                    [
                        "--output-format",
                        "stream-json",
                        "--verbose",
                        "--permission-mode",
                        "acceptEdits",
                    ]
                    .map(str::to_string),
                );
            }
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    fn drive(
        &self,
        request: &AgentRequest,
        collector: &mut StreamCollector,
        sink: &mut dyn OutputSink,
        cancel: &CancelToken,
    ) -> Result<Termination> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(&request.mode))
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let transcript = open_transcript(request.transcript_path.as_ref())?;

        debug!(binary = %self.binary, "spawning agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn agent `{}`", self.binary))?;
        let _active = cancel.enter_child();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;

        let chunks = spawn_chunk_reader(stdout);
        let limit = request.output_limit_bytes;
        let stderr_handle = thread::spawn(move || capture(stderr, limit));
        let input = request.input.clone().into_bytes();
        thread::spawn(move || {
            if let Err(err) = stdin.write_all(&input) {
                debug!(err = %err, "agent closed stdin early");
            }
        });

        let deadline = Instant::now() + request.timeout;
        let mut pump = StdoutPump::new(transcript);
        let stopped = loop {
            if let Some(stop) = interruption(cancel, deadline) {
                break Some(stop);
            }
            let wait = POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            match chunks.recv_timeout(wait) {
                Ok(chunk) => pump.accept(&chunk, collector, sink),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break None,
            }
        };

        if let Some(stop) = stopped {
            // Keep records that arrived before the stop, e.g. a last tool result.
            pump.drain(&chunks, collector, sink);
            kill(&mut child)?;
            log_stop(&stop, request.timeout);
            return Ok(stop);
        }
        pump.finish(collector, sink);

        let status = match wait_for_exit(&mut child, cancel, deadline)? {
            Ok(status) => status,
            Err(stop) => {
                kill(&mut child)?;
                log_stop(&stop, request.timeout);
                return Ok(stop);
            }
        };

        match stderr_handle.join() {
            Ok(Ok(stderr)) if !stderr.bytes.is_empty() => {
                debug!(
                    stderr = %stderr.text(),
                    dropped = stderr.dropped,
                    "agent stderr"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(err = %err, "failed to read agent stderr"),
            Err(_) => debug!("agent stderr reader panicked"),
        }

        debug!(exit_code = ?status.code(), "agent exited");
        Ok(Termination::Completed {
            exit_code: status.code(),
        })
    }
}

impl AgentBackend for ClaudeCliAgent {
    #[instrument(skip_all, fields(mode = ?request.mode, timeout_secs = request.timeout.as_secs()))]
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
        info!(workdir = %request.workdir.display(), "starting agent");
        let mut collector = StreamCollector::new(policy.verbose);
        let termination = match self.drive(request, &mut collector, sink, cancel) {
            Ok(termination) => termination,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent invocation failed");
                Termination::SpawnFailed(format!("{err:#}"))
            }
        };
        sink.finish();
        collector.into_run(termination)
    }
}

fn open_transcript(path: Option<&PathBuf>) -> Result<Option<BufWriter<File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create transcript dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create transcript {}", path.display()))?;
    Ok(Some(BufWriter::new(file)))
}

/// Read stdout in chunks on a helper thread; the channel closes at EOF.
/// Tees stdout chunks to the transcript and decodes them into the collector.
struct StdoutPump {
    parser: StreamParser,
    transcript: Option<BufWriter<File>>,
}

impl StdoutPump {
    fn new(transcript: Option<BufWriter<File>>) -> Self {
        Self {
            parser: StreamParser::new(),
            transcript,
        }
    }

    fn accept(&mut self, chunk: &[u8], collector: &mut StreamCollector, sink: &mut dyn OutputSink) {
        if let Some(writer) = self.transcript.as_mut()
            && let Err(err) = writer.write_all(chunk).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to write agent transcript");
        }
        for event in self.parser.feed(chunk) {
            collector.observe(event, sink);
        }
    }

    /// Consume whatever the reader already queued, without waiting for more.
    fn drain(
        &mut self,
        chunks: &Receiver<Vec<u8>>,
        collector: &mut StreamCollector,
        sink: &mut dyn OutputSink,
    ) {
        while let Ok(chunk) = chunks.try_recv() {
            self.accept(&chunk, collector, sink);
        }
    }

    fn finish(&mut self, collector: &mut StreamCollector, sink: &mut dyn OutputSink) {
        for event in self.parser.finish() {
            collector.observe(event, sink);
        }
    }
}

fn spawn_chunk_reader<R: Read + Send + 'static>(mut reader: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(err = %err, "agent stdout read failed");
                    break;
                }
            }
        }
    });
    rx
}

fn interruption(cancel: &CancelToken, deadline: Instant) -> Option<Termination> {
    if cancel.is_cancelled() {
        Some(Termination::Cancelled)
    } else if Instant::now() >= deadline {
        Some(Termination::TimedOut)
    } else {
        None
    }
}

/// Wait for the child after stdout closed, still honoring deadline and cancellation.
fn wait_for_exit(
    child: &mut Child,
    cancel: &CancelToken,
    deadline: Instant,
) -> Result<std::result::Result<ExitStatus, Termination>> {
    loop {
        if let Some(stop) = interruption(cancel, deadline) {
            return Ok(Err(stop));
        }
        let wait = POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
        if let Some(status) = child.wait_timeout(wait).context("wait for agent")? {
            return Ok(Ok(status));
        }
    }
}

fn kill(child: &mut Child) -> Result<()> {
    child.kill().context("kill agent")?;
    child.wait().context("wait agent after kill")?;
    Ok(())
}

fn log_stop(stop: &Termination, timeout: Duration) {
    match stop {
        Termination::TimedOut => {
            warn!(timeout_secs = timeout.as_secs(), "agent timed out, killed");
        }
        Termination::Cancelled => info!("agent cancelled, killed"),
        _ => {}
    }
}
