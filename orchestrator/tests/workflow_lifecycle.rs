//! Workflow-level tests for complete request lifecycles.
//!
//! These tests drive `Workflow::run` with a scripted agent and operator to
//! verify end-to-end behavior: sub-task ordering, the session-wide approve
//! flag, iteration bounds, partial application, and cancellation.

use std::fs;

use serde_json::Value;

use orchestrator::core::feedback::MAX_ITERATIONS;
use orchestrator::core::types::{
    DecompositionPlan, SessionPolicy, SubTask, TaskTerminal, Termination, VerifyOutcome,
    WorkflowResult,
};
use orchestrator::execution::Session;
use orchestrator::io::agent::AgentMode;
use orchestrator::io::cancel::CancelToken;
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::io::context::Collaborators;
use orchestrator::io::run_log::RunLog;
use orchestrator::io::verify::{CommandVerifier, Verifier};
use orchestrator::test_support::{
    RecordingSink, Reply, ScriptedAgent, ScriptedOperator, ScriptedRun, applied_write, applying,
    no_changes, proposing,
};
use orchestrator::workflow::{Workflow, WorkflowRequest};

struct Harness {
    project: tempfile::TempDir,
    config: OrchestratorConfig,
    collaborators: Collaborators,
    policy: SessionPolicy,
    verifier: Option<CommandVerifier>,
    cancel: CancelToken,
}

impl Harness {
    fn new() -> Self {
        Self {
            project: tempfile::tempdir().expect("tempdir"),
            config: OrchestratorConfig::default(),
            collaborators: Collaborators::null(),
            policy: SessionPolicy::default(),
            verifier: None,
            cancel: CancelToken::new(),
        }
    }

    fn with_plan(mut self, tasks: &[&str], order: &[&str]) -> Self {
        let plan = DecompositionPlan {
            is_complex: true,
            sub_tasks: tasks
                .iter()
                .map(|id| SubTask {
                    id: id.to_string(),
                    task_type: "implement".to_string(),
                    description: format!("sub-task {id}"),
                    search_terms: Vec::new(),
                    dependencies: Vec::new(),
                    context_filter: None,
                })
                .collect(),
            execution_plan: order.iter().map(|id| id.to_string()).collect(),
        };
        self.collaborators = Collaborators::null().with_plan(plan);
        self
    }

    fn run(
        &self,
        agent: &ScriptedAgent,
        operator: &mut ScriptedOperator,
        log: Option<&RunLog>,
    ) -> WorkflowResult {
        let mut sink = RecordingSink::default();
        let mut session = Session {
            agent,
            operator,
            sink: &mut sink,
            cancel: &self.cancel,
            policy: self.policy,
        };
        let workflow = Workflow {
            config: &self.config,
            collaborators: &self.collaborators,
            verifier: self.verifier.as_ref().map(|v| v as &dyn Verifier),
            run_log: log,
        };
        workflow.run(
            &mut session,
            &WorkflowRequest {
                query: "Add audit logging to the user service".to_string(),
                project: self.project.path().to_path_buf(),
            },
        )
    }
}

/// Zero denials on the first attempt is a successful no-op.
#[test]
fn zero_denials_succeeds_without_files() {
    let harness = Harness::new();
    let agent = ScriptedAgent::new([no_changes("s-1", "Audit logging already exists.")]);
    let mut operator = ScriptedOperator::default();

    let result = harness.run(&agent, &mut operator, None);

    assert!(result.success);
    assert!(result.files_modified.is_empty());
    assert!(result.error.is_none());
    assert_eq!(result.summary, "No changes needed.");
    assert!(operator.questions.is_empty());
}

/// Sub-tasks run in plan order; files are a deduplicated union.
#[test]
fn sub_tasks_follow_execution_plan_and_union_files() {
    let mut harness = Harness::new().with_plan(&["1", "2", "3"], &["2", "1", "3"]);
    harness.policy.approve_all = true;
    let agent = ScriptedAgent::new([
        proposing("s-2", &["b.ts", "shared.ts"]),
        applying("s-2", &["b.ts", "shared.ts"]),
        proposing("s-1", &["a.ts", "shared.ts"]),
        applying("s-1", &["a.ts", "shared.ts"]),
        no_changes("s-3", "Nothing left for sub-task 3."),
    ]);
    let mut operator = ScriptedOperator::default();

    let result = harness.run(&agent, &mut operator, None);

    assert!(result.success);
    let ids: Vec<&str> = result.sub_tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["2", "1", "3"]);
    assert_eq!(result.files_modified, vec!["b.ts", "shared.ts", "a.ts"]);
    assert!(agent.request(0).input.contains("Sub-task 2"));
    assert!(agent.request(2).input.contains("Sub-task 1"));
    assert!(agent.request(4).input.contains("Sub-task 3"));

    let first = result.response.find("## Sub-task 2: sub-task 2").expect("header 2");
    let second = result.response.find("## Sub-task 1: sub-task 1").expect("header 1");
    let third = result.response.find("## Sub-task 3: sub-task 3").expect("header 3");
    assert!(first < second && second < third);
    assert_eq!(result.verification, Some(VerifyOutcome::Skipped));
}

/// "Approve always" on the first gate skips the gate for every later sub-task.
#[test]
fn approve_always_skips_later_gates() {
    let harness = Harness::new().with_plan(&["1", "2"], &[]);
    let agent = ScriptedAgent::new([
        proposing("s-1", &["a.ts"]),
        applying("s-1", &["a.ts"]),
        proposing("s-2", &["b.ts"]),
        applying("s-2", &["b.ts"]),
    ]);
    let mut operator = ScriptedOperator::new([Reply::Choose(1)]);

    let result = harness.run(&agent, &mut operator, None);

    assert!(result.success);
    assert_eq!(result.files_modified, vec!["a.ts", "b.ts"]);
    assert_eq!(operator.questions, vec!["Apply these changes?"]);
    assert_eq!(
        agent.request(3).mode,
        AgentMode::Apply {
            session_id: "s-2".to_string()
        }
    );
}

/// Rejecting every proposal ends after exactly the iteration bound.
#[test]
fn rejections_exhaust_iterations() {
    let harness = Harness::new();
    let agent = ScriptedAgent::new(
        (0..MAX_ITERATIONS).map(|i| proposing(&format!("s-{i}"), &["a.ts"])),
    );
    let mut operator = ScriptedOperator::new(
        (0..MAX_ITERATIONS).flat_map(|i| [Reply::Choose(2), Reply::Text(format!("not yet {i}"))]),
    );

    let result = harness.run(&agent, &mut operator, None);

    assert_eq!(agent.analyze_calls(), MAX_ITERATIONS as usize);
    assert!(!result.success);
    assert_eq!(result.sub_tasks[0].terminal, TaskTerminal::IterationsExhausted);
    assert_eq!(result.error.as_deref(), Some("all feedback iterations exhausted"));
    let original = agent.request(0).input;
    for idx in 1..agent.calls() {
        let retry = agent.request(idx).input;
        assert!(retry.starts_with(&original));
        assert!(retry.contains(&format!("not yet {}", idx - 1)));
        assert!(!retry.contains(&format!("not yet {idx}")));
    }
}

/// A Phase 2 timeout still yields a result listing the confirmed files.
#[test]
fn phase_two_timeout_reports_partial_completion() {
    let mut harness = Harness::new();
    harness.policy.approve_all = true;
    let mut partial = applied_write("t1", "a.ts");
    partial.extend(applied_write("t2", "b.ts"));
    let agent = ScriptedAgent::new([
        proposing("s-1", &["a.ts", "b.ts", "c.ts"]),
        ScriptedRun::ended(partial, Termination::TimedOut),
    ]);
    let mut operator = ScriptedOperator::default();

    let result = harness.run(&agent, &mut operator, None);

    assert!(!result.success);
    assert_eq!(result.files_modified, vec!["a.ts", "b.ts"]);
    assert_eq!(result.sub_tasks[0].terminal, TaskTerminal::ApplyIncomplete);
    assert!(result.summary.contains("2 change(s) confirmed"));
}

/// Operator cancellation in the first sub-task stops the rest.
#[test]
fn cancellation_halts_remaining_sub_tasks() {
    let harness = Harness::new().with_plan(&["1", "2", "3"], &[]);
    let agent = ScriptedAgent::new([proposing("s-1", &["a.ts"])]);
    let mut operator = ScriptedOperator::new([Reply::Interrupt]);

    let result = harness.run(&agent, &mut operator, None);

    assert!(!result.success);
    assert!(harness.cancel.is_cancelled());
    assert_eq!(result.sub_tasks.len(), 1);
    assert_eq!(result.sub_tasks[0].terminal, TaskTerminal::Cancelled);
    assert_eq!(agent.calls(), 1);
}

/// Run artifacts are written per task attempt plus a final result.
#[test]
fn run_log_records_prompts_transcripts_and_result() {
    let mut harness = Harness::new();
    harness.policy.approve_all = true;
    let log = RunLog::create(harness.project.path(), "run-test").expect("run log");
    let agent = ScriptedAgent::new([proposing("s-1", &["a.ts"]), applying("s-1", &["a.ts"])]);
    let mut operator = ScriptedOperator::default();

    let result = harness.run(&agent, &mut operator, Some(&log));

    assert_eq!(result.run_id.as_deref(), Some("run-test"));
    let attempt = log.task(1).attempt(1);
    let prompt = fs::read_to_string(&attempt.prompt_path).expect("prompt");
    assert!(prompt.contains("Add audit logging to the user service"));
    let phase1 = fs::read_to_string(&attempt.phase1_path).expect("phase1");
    assert!(phase1.contains("permission_denials"));
    assert!(attempt.phase2_path.is_file());

    let report: Value = serde_json::from_str(
        &fs::read_to_string(log.dir().join("task-1").join("report.json")).expect("report"),
    )
    .expect("report json");
    assert_eq!(report["terminal"]["state"], "applied");

    let saved: Value = serde_json::from_str(
        &fs::read_to_string(log.dir().join("result.json")).expect("result"),
    )
    .expect("result json");
    assert_eq!(saved["success"], true);
    assert_eq!(saved["files_modified"][0], "a.ts");
}

/// Verification runs after modifications and a failure clears success.
#[cfg(unix)]
#[test]
fn failing_verification_marks_run_unsuccessful() {
    let mut harness = Harness::new();
    harness.policy.approve_all = true;
    harness.verifier = Some(CommandVerifier {
        argv: vec!["sh".to_string(), "-c".to_string(), "echo broken >&2; exit 1".to_string()],
    });
    let log = RunLog::create(harness.project.path(), "run-verify").expect("run log");
    let agent = ScriptedAgent::new([proposing("s-1", &["a.ts"]), applying("s-1", &["a.ts"])]);
    let mut operator = ScriptedOperator::default();

    let result = harness.run(&agent, &mut operator, Some(&log));

    assert!(!result.success);
    assert_eq!(result.verification, Some(VerifyOutcome::Fail));
    assert!(result.summary.ends_with("Verification failed."));
    let verify_log = fs::read_to_string(log.verify_log_path()).expect("verify log");
    assert!(verify_log.contains("broken"));
}
