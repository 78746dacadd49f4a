//! Two-phase execution of a single task.
//!
//! Phase 1 runs the agent without write permission, so every attempted file
//! change comes back as a permission denial. The denials become proposals,
//! the operator approves or rejects them, and on approval Phase 2 resumes the
//! same agent session with edits auto-accepted. Rejections feed back into a
//! fresh Phase 1 whose prompt is the original plus the latest feedback.
//!
//! The controller is an explicit state machine; every transition is logged at
//! `debug`.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::approval::{NoChangeChoice, confirm, no_changes_follow_up};
use crate::core::feedback::{MAX_ITERATIONS, feedback_prompt};
use crate::core::types::{
    ApprovalDecision, PhaseOneOutcome, ProposedChange, SessionPolicy, TaskOutcome, TaskTerminal,
    Termination,
};
use crate::io::agent::{
    AgentBackend, AgentMode, AgentRequest, AgentRun, DEFAULT_PHASE_TIMEOUT, PROCEED_DIRECTIVE,
};
use crate::io::cancel::CancelToken;
use crate::io::operator::Operator;
use crate::io::run_log::TaskLog;
use crate::io::sink::OutputSink;

/// Everything one orchestrator instance shares across tasks.
///
/// `policy` is the session-scoped flag set: the approval gate reads it and an
/// "approve always" answer writes it, for every later task in the session.
pub struct Session<'a> {
    pub agent: &'a dyn AgentBackend,
    pub operator: &'a mut dyn Operator,
    pub sink: &'a mut dyn OutputSink,
    pub cancel: &'a CancelToken,
    pub policy: SessionPolicy,
}

/// Per-task execution limits.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub workdir: PathBuf,
    /// Applies to each phase independently.
    pub phase_timeout: Duration,
    pub max_iterations: u32,
    pub output_limit_bytes: usize,
}

impl ExecutionSettings {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            max_iterations: MAX_ITERATIONS,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug)]
enum ExecutionState {
    Idle,
    Phase1Running {
        prompt: String,
    },
    NoChanges {
        outcome: PhaseOneOutcome,
    },
    AwaitingApproval {
        outcome: PhaseOneOutcome,
    },
    Phase2Running {
        session_id: String,
        changes: Vec<ProposedChange>,
    },
    RetryPending {
        feedback: String,
    },
    Finished {
        terminal: TaskTerminal,
        files: Vec<String>,
    },
}

impl ExecutionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Phase1Running { .. } => "phase1_running",
            Self::NoChanges { .. } => "no_changes",
            Self::AwaitingApproval { .. } => "awaiting_approval",
            Self::Phase2Running { .. } => "phase2_running",
            Self::RetryPending { .. } => "retry_pending",
            Self::Finished { terminal, .. } => match terminal {
                TaskTerminal::NoChanges
                | TaskTerminal::Applied
                | TaskTerminal::AcceptedWithoutChanges => "done",
                TaskTerminal::ApplyIncomplete => "apply_incomplete",
                TaskTerminal::TimedOut => "timed_out",
                TaskTerminal::Cancelled => "cancelled",
                TaskTerminal::IterationsExhausted => "iterations_exhausted",
                TaskTerminal::Failed(_) => "failed",
            },
        }
    }

    fn finished(terminal: TaskTerminal) -> Self {
        Self::Finished {
            terminal,
            files: Vec::new(),
        }
    }
}

/// Drives one task from its original prompt to a terminal state.
pub struct TwoPhaseController<'s, 'a> {
    session: &'s mut Session<'a>,
    settings: &'s ExecutionSettings,
    log: Option<&'s TaskLog>,
    original: String,
    attempt: u32,
    analysis: String,
    applied: String,
}

impl<'s, 'a> TwoPhaseController<'s, 'a> {
    pub fn new(
        session: &'s mut Session<'a>,
        settings: &'s ExecutionSettings,
        log: Option<&'s TaskLog>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session,
            settings,
            log,
            original: prompt.into(),
            attempt: 0,
            analysis: String::new(),
            applied: String::new(),
        }
    }

    pub fn run(mut self) -> TaskOutcome {
        let mut state = ExecutionState::Idle;
        loop {
            if let ExecutionState::Finished { terminal, files } = state {
                if terminal == TaskTerminal::Cancelled {
                    self.session.cancel.cancel();
                }
                return self.outcome(terminal, files);
            }
            let from = state.name();
            state = self.step(state);
            debug!(from, to = state.name(), attempt = self.attempt, "execution transition");
        }
    }

    fn step(&mut self, state: ExecutionState) -> ExecutionState {
        match state {
            ExecutionState::Idle => ExecutionState::Phase1Running {
                prompt: self.original.clone(),
            },
            ExecutionState::Phase1Running { prompt } => self.analyze(&prompt),
            ExecutionState::NoChanges { outcome } => self.no_changes(&outcome),
            ExecutionState::AwaitingApproval { outcome } => self.await_approval(outcome),
            ExecutionState::RetryPending { feedback } => {
                if self.attempt >= self.settings.max_iterations {
                    warn!(attempts = self.attempt, "feedback iterations exhausted");
                    return ExecutionState::finished(TaskTerminal::IterationsExhausted);
                }
                ExecutionState::Phase1Running {
                    prompt: feedback_prompt(&self.original, &feedback, self.attempt + 1),
                }
            }
            ExecutionState::Phase2Running {
                session_id,
                changes,
            } => self.apply(session_id, &changes),
            finished @ ExecutionState::Finished { .. } => finished,
        }
    }

    fn analyze(&mut self, prompt: &str) -> ExecutionState {
        self.attempt += 1;
        info!(attempt = self.attempt, "phase 1: analyzing");
        let transcript_path = self.log.map(|log| {
            if let Err(err) = log.write_prompt(self.attempt, prompt) {
                warn!(err = %format!("{err:#}"), "failed to log prompt");
            }
            log.attempt(self.attempt).phase1_path
        });
        let request = AgentRequest {
            workdir: self.settings.workdir.clone(),
            input: prompt.to_string(),
            mode: AgentMode::Analyze,
            timeout: self.settings.phase_timeout,
            transcript_path,
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let run = self.invoke(&request);
        self.analysis = run.response_text.trim().to_string();
        self.applied.clear();

        match &run.termination {
            Termination::Cancelled => ExecutionState::finished(TaskTerminal::Cancelled),
            Termination::SpawnFailed(err) => {
                ExecutionState::finished(TaskTerminal::Failed(err.clone()))
            }
            Termination::TimedOut if !run.finished => {
                ExecutionState::finished(TaskTerminal::TimedOut)
            }
            Termination::Completed { exit_code } if !run.finished && *exit_code != Some(0) => {
                ExecutionState::finished(TaskTerminal::Failed(format!(
                    "agent exited with status {exit_code:?} before producing a result"
                )))
            }
            _ if run.is_error => ExecutionState::finished(TaskTerminal::Failed(
                error_text(&run, "agent reported an error during analysis"),
            )),
            _ => {
                let outcome = run.phase_one_outcome();
                debug!(
                    proposals = outcome.proposed_changes.len(),
                    has_denials = outcome.has_denials,
                    "phase 1 finished"
                );
                if outcome.proposed_changes.is_empty() {
                    ExecutionState::NoChanges { outcome }
                } else {
                    ExecutionState::AwaitingApproval { outcome }
                }
            }
        }
    }

    fn no_changes(&mut self, outcome: &PhaseOneOutcome) -> ExecutionState {
        if self.attempt == 1 {
            return ExecutionState::finished(TaskTerminal::NoChanges);
        }
        match no_changes_follow_up(&outcome.response_text, &mut *self.session.operator) {
            NoChangeChoice::Guidance(feedback) => ExecutionState::RetryPending { feedback },
            NoChangeChoice::Accept => {
                ExecutionState::finished(TaskTerminal::AcceptedWithoutChanges)
            }
            NoChangeChoice::Cancelled => ExecutionState::finished(TaskTerminal::Cancelled),
        }
    }

    fn await_approval(&mut self, outcome: PhaseOneOutcome) -> ExecutionState {
        if self.session.cancel.is_cancelled() {
            return ExecutionState::finished(TaskTerminal::Cancelled);
        }
        let decision = confirm(
            &outcome.proposed_changes,
            self.session.policy,
            &mut *self.session.operator,
        );
        debug!(?decision, "approval decision");
        match decision {
            ApprovalDecision::Approve => approved(outcome),
            ApprovalDecision::ApproveAlways => {
                self.session.policy.approve_all = true;
                approved(outcome)
            }
            ApprovalDecision::RejectWithFeedback(feedback) => {
                ExecutionState::RetryPending { feedback }
            }
            ApprovalDecision::Cancelled => ExecutionState::finished(TaskTerminal::Cancelled),
        }
    }

    fn apply(&mut self, session_id: String, changes: &[ProposedChange]) -> ExecutionState {
        info!(changes = changes.len(), "phase 2: applying approved changes");
        self.session
            .operator
            .show(&format!("Applying {} approved change(s)...", changes.len()));
        let request = AgentRequest {
            workdir: self.settings.workdir.clone(),
            input: PROCEED_DIRECTIVE.to_string(),
            mode: AgentMode::Apply { session_id },
            timeout: self.settings.phase_timeout,
            transcript_path: self
                .log
                .map(|log| log.attempt(self.attempt).phase2_path),
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let run = self.invoke(&request);
        self.applied = run.response_text.trim().to_string();

        let confirmed = run.confirmed_paths.clone();
        match &run.termination {
            Termination::SpawnFailed(err) => {
                ExecutionState::finished(TaskTerminal::Failed(err.clone()))
            }
            Termination::Cancelled => ExecutionState::Finished {
                terminal: TaskTerminal::Cancelled,
                files: confirmed,
            },
            Termination::Completed { exit_code }
                if !run.is_error
                    && (run.finished || *exit_code == Some(0))
                    && changes.iter().all(|c| confirmed.contains(&c.file_path)) =>
            {
                ExecutionState::Finished {
                    terminal: TaskTerminal::Applied,
                    files: confirmed,
                }
            }
            _ => {
                let missing: Vec<&str> = changes
                    .iter()
                    .map(|c| c.file_path.as_str())
                    .filter(|path| !confirmed.iter().any(|done| done == path))
                    .collect();
                warn!(
                    confirmed = confirmed.len(),
                    approved = changes.len(),
                    ?missing,
                    "phase 2 stopped before confirming every change"
                );
                ExecutionState::Finished {
                    terminal: TaskTerminal::ApplyIncomplete,
                    files: confirmed,
                }
            }
        }
    }

    fn invoke(&mut self, request: &AgentRequest) -> AgentRun {
        let session = &mut *self.session;
        session
            .agent
            .run(request, &mut *session.sink, session.policy, session.cancel)
    }

    fn outcome(&self, terminal: TaskTerminal, files: Vec<String>) -> TaskOutcome {
        let summary = summarize(&terminal, &files, self.attempt);
        info!(
            terminal = ?terminal,
            attempts = self.attempt,
            files = files.len(),
            "task finished"
        );
        TaskOutcome {
            response: self.last_exchange(),
            files_modified: files,
            summary,
            terminal,
            attempts: self.attempt,
        }
    }

    /// Latest Phase 1 response, plus the Phase 2 response when one followed it.
    fn last_exchange(&self) -> String {
        match (self.analysis.is_empty(), self.applied.is_empty()) {
            (_, true) => self.analysis.clone(),
            (true, false) => self.applied.clone(),
            (false, false) => format!("{}\n\n{}", self.analysis, self.applied),
        }
    }
}

fn approved(outcome: PhaseOneOutcome) -> ExecutionState {
    match outcome.session_id {
        Some(session_id) => ExecutionState::Phase2Running {
            session_id,
            changes: outcome.proposed_changes,
        },
        None => ExecutionState::finished(TaskTerminal::Failed(
            "agent result carried no session id to resume".to_string(),
        )),
    }
}

fn error_text(run: &AgentRun, fallback: &str) -> String {
    let text = run.response_text.trim();
    if text.is_empty() {
        fallback.to_string()
    } else {
        text.to_string()
    }
}

fn summarize(terminal: &TaskTerminal, files: &[String], attempts: u32) -> String {
    match terminal {
        TaskTerminal::NoChanges => "No changes needed.".to_string(),
        TaskTerminal::Applied => {
            format!("Applied {} change(s): {}", files.len(), files.join(", "))
        }
        TaskTerminal::AcceptedWithoutChanges => {
            format!("Accepted without changes after {attempts} attempt(s).")
        }
        TaskTerminal::ApplyIncomplete => format!(
            "Apply incomplete: {} change(s) confirmed before the agent stopped{}",
            files.len(),
            list_suffix(files)
        ),
        TaskTerminal::TimedOut => "Agent timed out before producing a result.".to_string(),
        TaskTerminal::Cancelled => format!("Cancelled{}", list_suffix(files)),
        TaskTerminal::IterationsExhausted => {
            format!("Stopped after {attempts} attempt(s) without an approved change set.")
        }
        TaskTerminal::Failed(err) => format!("Failed: {err}"),
    }
}

fn list_suffix(files: &[String]) -> String {
    if files.is_empty() {
        ".".to_string()
    } else {
        format!(": {}", files.join(", "))
    }
}
