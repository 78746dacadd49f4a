//! Shared types for orchestrator core logic.
//!
//! These types define the contracts between the pure core (stream decoding,
//! proposal extraction, plan ordering, aggregation) and the I/O adapters that
//! talk to the agent, the operator, and the external collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File-write-class tool the agent attempted while it had no write permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeTool {
    Write,
    Edit,
}

impl ChangeTool {
    /// Map an agent tool name onto a write-class tool, if it is one.
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "Write" => Some(Self::Write),
            "Edit" => Some(Self::Edit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Write => "Write",
            Self::Edit => "Edit",
        }
    }
}

/// A change the agent wanted to make during Phase 1 but was not allowed to.
///
/// Identity is `file_path`: within one batch the last proposal for a path wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedChange {
    pub tool: ChangeTool,
    pub file_path: String,
    /// Full file body (`Write`).
    pub content: Option<String>,
    /// Text being replaced (`Edit`).
    pub old_text: Option<String>,
    /// Replacement text (`Edit`).
    pub new_text: Option<String>,
}

/// A permission denial as reported in the agent's final result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDenial {
    pub tool_name: String,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_input: Value,
}

/// Operator decision returned by the approval gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// Approve now and skip the gate for the rest of the session.
    ApproveAlways,
    RejectWithFeedback(String),
    Cancelled,
}

/// Session-scoped flags owned by one orchestrator instance.
///
/// Written by explicit configuration or by the approval gate, read by every
/// later gate check. Execution is sequential, so no locking is involved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    pub approve_all: bool,
    pub verbose: bool,
}

/// How a single agent invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed { exit_code: Option<i32> },
    TimedOut,
    Cancelled,
    /// The agent could not be started (or its pipes could not be set up).
    SpawnFailed(String),
}

/// Result of one unprivileged analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOneOutcome {
    pub session_id: Option<String>,
    pub response_text: String,
    pub proposed_changes: Vec<ProposedChange>,
    pub has_denials: bool,
    pub termination: Termination,
}

/// Post-apply build/test verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyOutcome {
    Pass,
    Fail,
    /// Nothing was modified, or no verification command is configured.
    Skipped,
}

/// Terminal state reached by the two-phase controller for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum TaskTerminal {
    /// First attempt proposed nothing: no modification needed.
    NoChanges,
    /// Approved changes were applied.
    Applied,
    /// A retry proposed nothing and the operator accepted that as final.
    AcceptedWithoutChanges,
    /// Phase 2 ended without a successful tool result for every approved change.
    ApplyIncomplete,
    /// Phase 1 timed out before the agent produced its final result.
    TimedOut,
    Cancelled,
    IterationsExhausted,
    Failed(String),
}

impl TaskTerminal {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::NoChanges | Self::Applied | Self::AcceptedWithoutChanges
        )
    }

    /// Whether the remaining sub-tasks must not run after this one.
    pub fn halts_workflow(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed(_))
    }

    /// Error text surfaced through `WorkflowResult.error`, if any.
    pub fn hard_error(&self) -> Option<String> {
        match self {
            Self::Failed(err) => Some(err.clone()),
            Self::IterationsExhausted => Some("all feedback iterations exhausted".to_string()),
            _ => None,
        }
    }
}

/// Final output of the two-phase controller for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub response: String,
    pub files_modified: Vec<String>,
    pub summary: String,
    pub terminal: TaskTerminal,
    /// Number of Phase 1 invocations that were started.
    pub attempts: u32,
}

impl TaskOutcome {
    /// A task that could not be started (context or prompt preparation failed).
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            response: String::new(),
            files_modified: Vec::new(),
            summary: format!("Failed: {error}"),
            terminal: TaskTerminal::Failed(error),
            attempts: 0,
        }
    }
}

/// One ranked file match from the retrieval collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub file: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, alias = "similarityScore")]
    pub similarity_score: f64,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(alias = "fromEntity")]
    pub from_entity: String,
    #[serde(alias = "toEntity")]
    pub to_entity: String,
    #[serde(alias = "relationType")]
    pub relation_type: String,
    #[serde(default)]
    pub locations: Vec<String>,
}

/// Graph collaborator output for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphAnalysis {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub packages: Vec<String>,
}

/// Intent classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentAnalysis {
    pub intent: String,
    pub confidence: f64,
    pub assumptions: Vec<String>,
    pub ambiguities: Vec<String>,
}

impl Default for IntentAnalysis {
    fn default() -> Self {
        Self {
            intent: "modify".to_string(),
            confidence: 0.0,
            assumptions: Vec::new(),
            ambiguities: Vec::new(),
        }
    }
}

/// Restricts which retrieval hits feed a sub-task's prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextFilter {
    pub path_prefixes: Vec<String>,
    pub kinds: Vec<String>,
}

impl ContextFilter {
    pub fn matches(&self, hit: &SearchHit) -> bool {
        let path_ok = self.path_prefixes.is_empty()
            || self
                .path_prefixes
                .iter()
                .any(|prefix| hit.file.starts_with(prefix.as_str()));
        let kind_ok = self.kinds.is_empty() || self.kinds.iter().any(|k| k == &hit.kind);
        path_ok && kind_ok
    }
}

/// One unit of a decomposed request. Read-only input to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    pub description: String,
    #[serde(default, alias = "searchTerms")]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "contextFilter")]
    pub context_filter: Option<ContextFilter>,
}

fn default_task_type() -> String {
    "implement".to_string()
}

/// Decomposition collaborator output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionPlan {
    #[serde(alias = "isComplex")]
    pub is_complex: bool,
    #[serde(alias = "subTasks")]
    pub sub_tasks: Vec<SubTask>,
    /// Preferred ordering of sub-task ids; dependencies still take precedence.
    #[serde(alias = "executionPlan")]
    pub execution_plan: Vec<String>,
}

/// Per-sub-task line in the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubTaskReport {
    pub id: String,
    pub description: String,
    pub terminal: TaskTerminal,
    pub attempts: u32,
    pub files_modified: Vec<String>,
}

/// Counts of retrieval/graph artifacts gathered across the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextTotals {
    pub search_hits: usize,
    pub entities: usize,
    pub relationships: usize,
}

/// Aggregate result of one top-level request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowResult {
    pub run_id: Option<String>,
    pub success: bool,
    pub files_modified: Vec<String>,
    pub response: String,
    pub summary: String,
    /// Populated only on hard failure.
    pub error: Option<String>,
    pub verification: Option<VerifyOutcome>,
    pub sub_tasks: Vec<SubTaskReport>,
    pub context: ContextTotals,
}

impl WorkflowResult {
    /// Result for a request that failed before any sub-task ran.
    pub fn failed(run_id: Option<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            run_id,
            success: false,
            files_modified: Vec::new(),
            response: String::new(),
            summary: format!("Workflow failed: {error}"),
            error: Some(error),
            verification: None,
            sub_tasks: Vec::new(),
            context: ContextTotals::default(),
        }
    }

    /// Result for a request the operator cancelled before any sub-task ran.
    pub fn cancelled(run_id: Option<String>) -> Self {
        Self {
            run_id,
            success: false,
            files_modified: Vec::new(),
            response: String::new(),
            summary: "Cancelled.".to_string(),
            error: None,
            verification: None,
            sub_tasks: Vec::new(),
            context: ContextTotals::default(),
        }
    }
}
