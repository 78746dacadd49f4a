//! Top-level request workflow.
//!
//! One request runs as: intent classification, optional clarification,
//! decomposition into ordered sub-tasks (or a single implicit task), then per
//! task a context fetch, prompt render, and two-phase execution. Results merge
//! into one [`WorkflowResult`]; verification runs once at the end.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{error, info, instrument, warn};

use crate::core::aggregate::Aggregate;
use crate::core::plan::execution_order;
use crate::core::types::{
    GraphAnalysis, IntentAnalysis, SearchHit, SubTask, SubTaskReport, TaskOutcome, VerifyOutcome,
    WorkflowResult,
};
use crate::execution::{ExecutionSettings, Session, TwoPhaseController};
use crate::io::config::OrchestratorConfig;
use crate::io::context::Collaborators;
use crate::io::operator::Operator;
use crate::io::prompt::{Clarification, PromptBuilder, PromptInputs};
use crate::io::run_log::{RunLog, TaskLog};
use crate::io::verify::{Verifier, VerifyRequest, run_verification_if_needed};

/// One operator request against a project.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub query: String,
    pub project: PathBuf,
}

/// Long-lived dependencies of a workflow run.
pub struct Workflow<'w> {
    pub config: &'w OrchestratorConfig,
    pub collaborators: &'w Collaborators,
    pub verifier: Option<&'w dyn Verifier>,
    pub run_log: Option<&'w RunLog>,
}

impl Workflow<'_> {
    /// Run the request to completion.
    ///
    /// Never fails: hard failures before any sub-task ran become
    /// [`WorkflowResult::failed`]; a failure while preparing a later sub-task
    /// is recorded against that sub-task so earlier results are kept. The
    /// result is also written to the run log.
    #[instrument(skip_all, fields(run_id = self.run_log.map(RunLog::run_id)))]
    pub fn run(&self, session: &mut Session<'_>, request: &WorkflowRequest) -> WorkflowResult {
        let run_id = self.run_log.map(|log| log.run_id().to_string());
        let result = match self.execute(session, request, run_id.clone()) {
            Ok(result) => result,
            Err(err) => {
                let err = format!("{err:#}");
                error!(%err, "workflow failed");
                WorkflowResult::failed(run_id, err)
            }
        };
        if let Some(log) = self.run_log {
            if let Err(err) = log.write_result(&result) {
                warn!(err = %format!("{err:#}"), "failed to write run result");
            }
        }
        result
    }

    fn execute(
        &self,
        session: &mut Session<'_>,
        request: &WorkflowRequest,
        run_id: Option<String>,
    ) -> Result<WorkflowResult> {
        self.config.validate()?;
        if !request.project.is_dir() {
            bail!(
                "project path {} does not exist or is not a directory",
                request.project.display()
            );
        }
        if request.query.trim().is_empty() {
            bail!("request is empty");
        }
        let prompts = PromptBuilder::new(self.config.prompt_budget_bytes)?;

        let intent = self.collaborate("intent", || {
            self.collaborators.intent.classify(&request.query)
        })?;
        info!(intent = %intent.intent, confidence = intent.confidence, "request classified");

        let Some(clarifications) = self.clarify(&intent, &mut *session.operator) else {
            info!("operator cancelled during clarification");
            session.cancel.cancel();
            return Ok(WorkflowResult::cancelled(run_id));
        };

        let plan = self.collaborate("decompose", || {
            self.collaborators.decomposer.decompose(&request.query, &intent)
        })?;
        let decomposed = plan.is_complex && !plan.sub_tasks.is_empty();
        let tasks = if decomposed {
            execution_order(&plan).context("decomposition plan is invalid")?
        } else {
            vec![implicit_task(&request.query, &intent)]
        };
        info!(tasks = tasks.len(), decomposed, "execution planned");

        let settings = ExecutionSettings {
            workdir: request.project.clone(),
            phase_timeout: Duration::from_secs(self.config.agent.phase_timeout_secs),
            max_iterations: self.config.max_iterations,
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let mut aggregate = Aggregate::new();
        let mut completed: Vec<String> = Vec::new();

        for (idx, task) in tasks.iter().enumerate() {
            let header = decomposed.then(|| format!("## Sub-task {}: {}", task.id, task.description));
            let task_log = self.run_log.map(|log| log.task(idx + 1));
            let prepared = self
                .gather_context(task, &request.project)
                .and_then(|(hits, graph)| {
                    aggregate.artifacts.absorb(&hits, &graph);
                    prompts.build(&PromptInputs {
                        project: request.project.display().to_string(),
                        request: request.query.clone(),
                        sub_task: decomposed.then(|| task.clone()),
                        intent: Some(intent.clone()),
                        clarifications: clarifications.clone(),
                        completed: completed.clone(),
                        hits,
                        graph,
                    })
                });
            let prompt = match prepared {
                Ok(prompt) => prompt,
                Err(err) if idx == 0 => return Err(err),
                Err(err) => {
                    let err = format!("{err:#}");
                    error!(task = %task.id, %err, "sub-task could not be prepared");
                    let outcome = TaskOutcome::failed(err);
                    aggregate.record(&task.id, &task.description, header.as_deref(), &outcome);
                    write_report(task_log.as_ref(), task, &outcome);
                    break;
                }
            };

            if decomposed {
                session.operator.show(&format!(
                    "Sub-task {}/{} [{}]: {}",
                    idx + 1,
                    tasks.len(),
                    task.id,
                    task.description
                ));
            }
            let outcome =
                TwoPhaseController::new(session, &settings, task_log.as_ref(), prompt).run();

            aggregate.record(&task.id, &task.description, header.as_deref(), &outcome);
            write_report(task_log.as_ref(), task, &outcome);
            completed.push(format!("[{}] {}: {}", task.id, task.description, outcome.summary));

            if aggregate.is_halted() {
                warn!(
                    task = %task.id,
                    remaining = tasks.len() - idx - 1,
                    "sub-task halted the workflow"
                );
                break;
            }
        }

        let verification = if session.cancel.is_cancelled() {
            None
        } else {
            Some(self.verify(aggregate.files_modified(), &request.project))
        };
        Ok(aggregate.finish(run_id, tasks.len(), verification))
    }

    /// One free-text question per ambiguity; `None` when the operator interrupts.
    fn clarify(
        &self,
        intent: &IntentAnalysis,
        operator: &mut dyn Operator,
    ) -> Option<Vec<Clarification>> {
        if !self.config.ask_clarifications || intent.ambiguities.is_empty() {
            return Some(Vec::new());
        }
        operator.show("The request is ambiguous in a few places. Please clarify:");
        let mut answers = Vec::with_capacity(intent.ambiguities.len());
        for question in &intent.ambiguities {
            let answer = operator.ask_text(question)?;
            let answer = answer.trim();
            if !answer.is_empty() {
                answers.push(Clarification {
                    question: question.clone(),
                    answer: answer.to_string(),
                });
            }
        }
        Some(answers)
    }

    fn gather_context(
        &self,
        task: &SubTask,
        project: &Path,
    ) -> Result<(Vec<SearchHit>, GraphAnalysis)> {
        let query = search_query(task);
        let hits: Vec<SearchHit> =
            self.collaborate("search", || self.collaborators.retriever.search(&query, project))?;
        let hits = match &task.context_filter {
            Some(filter) => hits.into_iter().filter(|hit| filter.matches(hit)).collect(),
            None => hits,
        };
        let graph = self.collaborate("graph", || self.collaborators.graph.analyze(&query, &hits))?;
        Ok((hits, graph))
    }

    /// Run a collaborator call; failures degrade to empty output unless required.
    fn collaborate<T: Default>(&self, name: &str, call: impl FnOnce() -> Result<T>) -> Result<T> {
        match call() {
            Ok(value) => Ok(value),
            Err(err) if !self.config.collaborators.required => {
                warn!(
                    collaborator = name,
                    err = %format!("{err:#}"),
                    "collaborator failed, continuing without its output"
                );
                Ok(T::default())
            }
            Err(err) => Err(err.context(format!("{name} collaborator failed"))),
        }
    }

    fn verify(&self, files_modified: &[String], project: &Path) -> VerifyOutcome {
        let request = VerifyRequest {
            workdir: project.to_path_buf(),
            log_path: self.run_log.map(RunLog::verify_log_path),
            timeout: Duration::from_secs(self.config.verify.timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        match run_verification_if_needed(files_modified, self.verifier, &request) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "verification could not run");
                VerifyOutcome::Fail
            }
        }
    }
}

/// The single task used when a request is not decomposed.
fn implicit_task(query: &str, intent: &IntentAnalysis) -> SubTask {
    SubTask {
        id: "1".to_string(),
        task_type: intent.intent.clone(),
        description: query.to_string(),
        search_terms: Vec::new(),
        dependencies: Vec::new(),
        context_filter: None,
    }
}

fn search_query(task: &SubTask) -> String {
    if task.search_terms.is_empty() {
        task.description.clone()
    } else {
        format!("{} {}", task.description, task.search_terms.join(" "))
    }
}

fn write_report(log: Option<&TaskLog>, task: &SubTask, outcome: &TaskOutcome) {
    let Some(log) = log else { return };
    let report = SubTaskReport {
        id: task.id.clone(),
        description: task.description.clone(),
        terminal: outcome.terminal.clone(),
        attempts: outcome.attempts,
        files_modified: outcome.files_modified.clone(),
    };
    if let Err(err) = log.write_report(&report) {
        warn!(task = %task.id, err = %format!("{err:#}"), "failed to write sub-task report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use anyhow::anyhow;

    use crate::core::types::{ContextFilter, DecompositionPlan, SessionPolicy, TaskTerminal};
    use crate::io::cancel::CancelToken;
    use crate::io::context::{GraphAnalyzer, IntentClassifier, Retriever};
    use crate::test_support::{
        RecordingSink, Reply, ScriptedAgent, ScriptedOperator, applying, no_changes, proposing,
    };

    struct FixedHits(Vec<SearchHit>);

    impl Retriever for FixedHits {
        fn search(&self, _query: &str, _project: &Path) -> Result<Vec<SearchHit>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Retriever for Failing {
        fn search(&self, _query: &str, _project: &Path) -> Result<Vec<SearchHit>> {
            Err(anyhow!("index offline"))
        }
    }

    /// Answers the first search, then goes offline.
    #[derive(Default)]
    struct FlakyIndex {
        calls: Cell<u32>,
    }

    impl Retriever for FlakyIndex {
        fn search(&self, _query: &str, _project: &Path) -> Result<Vec<SearchHit>> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() > 1 {
                return Err(anyhow!("index offline"));
            }
            Ok(Vec::new())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingGraph {
        seeds: Rc<RefCell<Vec<usize>>>,
    }

    impl GraphAnalyzer for RecordingGraph {
        fn analyze(&self, _query: &str, seeds: &[SearchHit]) -> Result<GraphAnalysis> {
            self.seeds.borrow_mut().push(seeds.len());
            Ok(GraphAnalysis::default())
        }
    }

    struct Ambiguous;

    impl IntentClassifier for Ambiguous {
        fn classify(&self, _query: &str) -> Result<IntentAnalysis> {
            Ok(IntentAnalysis {
                intent: "modify".to_string(),
                confidence: 0.4,
                assumptions: Vec::new(),
                ambiguities: vec!["Which module?".to_string()],
            })
        }
    }

    fn hit(file: &str, kind: &str) -> SearchHit {
        SearchHit {
            file: file.to_string(),
            kind: kind.to_string(),
            similarity_score: 0.9,
            snippet: String::new(),
        }
    }

    fn task(id: &str, deps: &[&str]) -> SubTask {
        SubTask {
            id: id.to_string(),
            task_type: "implement".to_string(),
            description: format!("task {id}"),
            search_terms: Vec::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            context_filter: None,
        }
    }

    fn run(
        config: &OrchestratorConfig,
        collaborators: &Collaborators,
        agent: &ScriptedAgent,
        operator: &mut ScriptedOperator,
        project: &Path,
    ) -> WorkflowResult {
        let cancel = CancelToken::new();
        let mut sink = RecordingSink::default();
        let mut session = Session {
            agent,
            operator,
            sink: &mut sink,
            cancel: &cancel,
            policy: SessionPolicy::default(),
        };
        let workflow = Workflow {
            config,
            collaborators,
            verifier: None,
            run_log: None,
        };
        workflow.run(
            &mut session,
            &WorkflowRequest {
                query: "Add pagination to the user list".to_string(),
                project: project.to_path_buf(),
            },
        )
    }

    /// Verifies an undecomposed request runs one implicit task without headers.
    #[test]
    fn single_task_request_needs_no_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::new([no_changes("s-1", "Already paginated.")]);
        let mut operator = ScriptedOperator::default();
        let result = run(
            &OrchestratorConfig::default(),
            &Collaborators::null(),
            &agent,
            &mut operator,
            temp.path(),
        );

        assert!(result.success);
        assert!(result.files_modified.is_empty());
        assert_eq!(result.response, "Already paginated.");
        assert_eq!(result.verification, Some(VerifyOutcome::Skipped));
        assert!(agent.request(0).input.contains("Add pagination to the user list"));
    }

    /// Verifies a missing project directory is a hard failure before any agent call.
    #[test]
    fn missing_project_fails_without_running_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::default();
        let mut operator = ScriptedOperator::default();
        let result = run(
            &OrchestratorConfig::default(),
            &Collaborators::null(),
            &agent,
            &mut operator,
            &temp.path().join("missing"),
        );

        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("does not exist")));
        assert_eq!(agent.calls(), 0);
    }

    /// Verifies an invalid plan surfaces as a workflow error.
    #[test]
    fn cyclic_plan_is_a_hard_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = DecompositionPlan {
            is_complex: true,
            sub_tasks: vec![task("1", &["2"]), task("2", &["1"])],
            execution_plan: Vec::new(),
        };
        let agent = ScriptedAgent::default();
        let mut operator = ScriptedOperator::default();
        let result = run(
            &OrchestratorConfig::default(),
            &Collaborators::null().with_plan(plan),
            &agent,
            &mut operator,
            temp.path(),
        );
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("cycle")));
        assert_eq!(agent.calls(), 0);
    }

    /// Verifies optional collaborator failures degrade while required ones fail the run.
    #[test]
    fn collaborator_failure_respects_required_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collaborators = Collaborators::null();
        collaborators.retriever = Box::new(Failing);

        let agent = ScriptedAgent::new([no_changes("s-1", "ok")]);
        let mut operator = ScriptedOperator::default();
        let result = run(
            &OrchestratorConfig::default(),
            &collaborators,
            &agent,
            &mut operator,
            temp.path(),
        );
        assert!(result.success);

        let mut config = OrchestratorConfig::default();
        config.collaborators.required = true;
        let agent = ScriptedAgent::default();
        let result = run(&config, &collaborators, &agent, &mut operator, temp.path());
        assert!(!result.success);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("index offline")));
    }

    /// Verifies a later sub-task that cannot gather context keeps earlier applied files.
    #[test]
    fn later_context_failure_keeps_applied_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = DecompositionPlan {
            is_complex: true,
            sub_tasks: vec![task("1", &[]), task("2", &[])],
            execution_plan: Vec::new(),
        };
        let mut collaborators = Collaborators::null().with_plan(plan);
        collaborators.retriever = Box::new(FlakyIndex::default());
        let mut config = OrchestratorConfig::default();
        config.collaborators.required = true;

        let agent = ScriptedAgent::new([proposing("s-1", &["a.ts"]), applying("s-1", &["a.ts"])]);
        let mut operator = ScriptedOperator::new([Reply::Choose(0)]);
        let result = run(&config, &collaborators, &agent, &mut operator, temp.path());

        assert!(!result.success);
        assert_eq!(result.files_modified, vec!["a.ts"]);
        assert_eq!(result.sub_tasks.len(), 2);
        assert_eq!(result.sub_tasks[0].terminal, TaskTerminal::Applied);
        assert!(matches!(result.sub_tasks[1].terminal, TaskTerminal::Failed(_)));
        let error = result.error.as_deref().expect("error");
        assert!(error.starts_with("sub-task 2:"));
        assert!(error.contains("index offline"));
        assert_eq!(agent.calls(), 2);
        assert_eq!(result.verification, Some(VerifyOutcome::Skipped));
    }

    /// Verifies context filters trim the hits passed to the graph and the prompt.
    #[test]
    fn context_filter_limits_hits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let graph = RecordingGraph::default();
        let mut filtered = task("1", &[]);
        filtered.context_filter = Some(ContextFilter {
            path_prefixes: vec!["src/api".to_string()],
            kinds: Vec::new(),
        });
        let plan = DecompositionPlan {
            is_complex: true,
            sub_tasks: vec![filtered],
            execution_plan: Vec::new(),
        };
        let mut collaborators = Collaborators::null().with_plan(plan);
        collaborators.retriever = Box::new(FixedHits(vec![
            hit("src/api/users.ts", "code"),
            hit("docs/users.md", "docs"),
        ]));
        collaborators.graph = Box::new(graph.clone());

        let agent = ScriptedAgent::new([no_changes("s-1", "ok")]);
        let mut operator = ScriptedOperator::default();
        let result = run(
            &OrchestratorConfig::default(),
            &collaborators,
            &agent,
            &mut operator,
            temp.path(),
        );

        assert_eq!(*graph.seeds.borrow(), vec![1]);
        assert_eq!(result.context.search_hits, 1);
        let prompt = agent.request(0).input;
        assert!(prompt.contains("src/api/users.ts"));
        assert!(!prompt.contains("docs/users.md"));
        assert!(result.response.starts_with("## Sub-task 1: task 1"));
    }

    /// Verifies clarification answers reach the prompt and an interrupt cancels the run.
    #[test]
    fn clarifications_are_asked_per_ambiguity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collaborators = Collaborators::null();
        collaborators.intent = Box::new(Ambiguous);

        let agent = ScriptedAgent::new([no_changes("s-1", "ok")]);
        let mut operator = ScriptedOperator::new([Reply::Text("the users module".to_string())]);
        let result = run(
            &OrchestratorConfig::default(),
            &collaborators,
            &agent,
            &mut operator,
            temp.path(),
        );
        assert!(result.success);
        assert_eq!(operator.questions, vec!["Which module?"]);
        assert!(agent.request(0).input.contains("the users module"));

        let agent = ScriptedAgent::default();
        let mut operator = ScriptedOperator::new([Reply::Interrupt]);
        let result = run(
            &OrchestratorConfig::default(),
            &collaborators,
            &agent,
            &mut operator,
            temp.path(),
        );
        assert!(!result.success);
        assert!(result.error.is_none());
        assert_eq!(result.summary, "Cancelled.");
        assert!(result.sub_tasks.is_empty());
        assert_eq!(agent.calls(), 0);

        let config = OrchestratorConfig {
            ask_clarifications: false,
            ..OrchestratorConfig::default()
        };
        let agent = ScriptedAgent::new([no_changes("s-1", "ok")]);
        let mut operator = ScriptedOperator::default();
        let result = run(&config, &collaborators, &agent, &mut operator, temp.path());
        assert!(result.success);
    }

    /// Verifies a cancelled sub-task stops the rest and skips verification.
    #[test]
    fn cancelled_sub_task_halts_remaining() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = DecompositionPlan {
            is_complex: true,
            sub_tasks: vec![task("1", &[]), task("2", &[])],
            execution_plan: Vec::new(),
        };
        let agent = ScriptedAgent::new([proposing("s-1", &["a.ts"])]);
        let mut operator = ScriptedOperator::new([Reply::Interrupt]);
        let result = run(
            &OrchestratorConfig::default(),
            &Collaborators::null().with_plan(plan),
            &agent,
            &mut operator,
            temp.path(),
        );

        assert!(!result.success);
        assert_eq!(result.sub_tasks.len(), 1);
        assert_eq!(result.sub_tasks[0].terminal, TaskTerminal::Cancelled);
        assert_eq!(agent.calls(), 1);
        assert_eq!(result.verification, None);
        assert!(result.summary.contains("1 sub-task(s) not run"));
    }
}
