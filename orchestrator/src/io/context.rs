//! Context collaborators: retrieval, graph analysis, intent, decomposition.
//!
//! Each collaborator is a narrow trait. The orchestrator only consumes their
//! outputs; how scores are computed or graphs stored lives elsewhere. Two
//! implementations ship here: command-backed adapters that exchange JSON with
//! an external program, and null implementations used when nothing is
//! configured.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use crate::core::types::{DecompositionPlan, GraphAnalysis, IntentAnalysis, SearchHit};
use crate::io::config::CollaboratorConfig;
use crate::io::process::{Bounds, run_bounded};

pub trait Retriever {
    fn search(&self, query: &str, project: &Path) -> Result<Vec<SearchHit>>;
}

pub trait GraphAnalyzer {
    fn analyze(&self, query: &str, seeds: &[SearchHit]) -> Result<GraphAnalysis>;
}

pub trait IntentClassifier {
    fn classify(&self, query: &str) -> Result<IntentAnalysis>;
}

pub trait Decomposer {
    fn decompose(&self, query: &str, intent: &IntentAnalysis) -> Result<DecompositionPlan>;
}

/// The full set of collaborators one workflow consults.
pub struct Collaborators {
    pub retriever: Box<dyn Retriever>,
    pub graph: Box<dyn GraphAnalyzer>,
    pub intent: Box<dyn IntentClassifier>,
    pub decomposer: Box<dyn Decomposer>,
}

impl Collaborators {
    /// No context and a single implicit task.
    pub fn null() -> Self {
        Self {
            retriever: Box::new(NullCollaborator),
            graph: Box::new(NullCollaborator),
            intent: Box::new(NullCollaborator),
            decomposer: Box::new(NullCollaborator),
        }
    }

    /// Command-backed collaborators where configured, null ones elsewhere.
    pub fn from_config(cfg: &CollaboratorConfig, workdir: &Path, output_limit_bytes: usize) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let command = |argv: &[String]| {
            (!argv.is_empty()).then(|| CommandCollaborator {
                argv: argv.to_vec(),
                workdir: workdir.to_path_buf(),
                timeout,
                output_limit_bytes,
            })
        };
        Self {
            retriever: match command(&cfg.search) {
                Some(c) => Box::new(c),
                None => Box::new(NullCollaborator),
            },
            graph: match command(&cfg.graph) {
                Some(c) => Box::new(c),
                None => Box::new(NullCollaborator),
            },
            intent: match command(&cfg.intent) {
                Some(c) => Box::new(c),
                None => Box::new(NullCollaborator),
            },
            decomposer: match command(&cfg.decompose) {
                Some(c) => Box::new(c),
                None => Box::new(NullCollaborator),
            },
        }
    }

    /// Replace the decomposer with a fixed plan (from `--plan`).
    pub fn with_plan(mut self, plan: DecompositionPlan) -> Self {
        self.decomposer = Box::new(FixedPlan(plan));
        self
    }
}

/// Returns empty context, a generic intent, and a non-complex plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCollaborator;

impl Retriever for NullCollaborator {
    fn search(&self, _query: &str, _project: &Path) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

impl GraphAnalyzer for NullCollaborator {
    fn analyze(&self, _query: &str, _seeds: &[SearchHit]) -> Result<GraphAnalysis> {
        Ok(GraphAnalysis::default())
    }
}

impl IntentClassifier for NullCollaborator {
    fn classify(&self, _query: &str) -> Result<IntentAnalysis> {
        Ok(IntentAnalysis::default())
    }
}

impl Decomposer for NullCollaborator {
    fn decompose(&self, _query: &str, _intent: &IntentAnalysis) -> Result<DecompositionPlan> {
        Ok(DecompositionPlan::default())
    }
}

/// Decomposer that always hands back the same plan.
#[derive(Debug, Clone)]
pub struct FixedPlan(pub DecompositionPlan);

impl Decomposer for FixedPlan {
    fn decompose(&self, _query: &str, _intent: &IntentAnalysis) -> Result<DecompositionPlan> {
        Ok(self.0.clone())
    }
}

/// Runs an external program and reads one JSON document from its stdout.
///
/// | Collaborator | Arguments appended | stdin |
/// |---|---|---|
/// | search | `<query> <project>` | none |
/// | graph | none | `{query, seeds}` |
/// | intent | `<query>` | none |
/// | decompose | none | `{query, intent}` |
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandCollaborator {
    #[instrument(skip_all, fields(program = %self.argv.first().map(String::as_str).unwrap_or_default()))]
    fn invoke<T: DeserializeOwned>(&self, extra_args: &[&str], stdin: Option<Vec<u8>>) -> Result<T> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("collaborator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).args(extra_args).current_dir(&self.workdir);

        let bounds = Bounds {
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        let output = run_bounded(cmd, stdin, bounds)
            .with_context(|| format!("run collaborator `{program}`"))?;
        if output.timed_out {
            bail!(
                "collaborator `{program}` timed out after {}s",
                self.timeout.as_secs()
            );
        }
        if !output.status.success() {
            bail!(
                "collaborator `{program}` exited with status {:?}: {}",
                output.status.code(),
                output.stderr.text().trim()
            );
        }
        if output.stdout.is_truncated() {
            bail!(
                "collaborator `{program}` output exceeded {} bytes",
                self.output_limit_bytes
            );
        }
        debug!(bytes = output.stdout.bytes.len(), "collaborator responded");
        serde_json::from_slice(&output.stdout.bytes)
            .with_context(|| format!("parse collaborator `{program}` output"))
    }
}

impl Retriever for CommandCollaborator {
    fn search(&self, query: &str, project: &Path) -> Result<Vec<SearchHit>> {
        let project = project.to_string_lossy();
        self.invoke(&[query, project.as_ref()], None)
    }
}

impl GraphAnalyzer for CommandCollaborator {
    fn analyze(&self, query: &str, seeds: &[SearchHit]) -> Result<GraphAnalysis> {
        let payload = serde_json::to_vec(&json!({ "query": query, "seeds": seeds }))
            .context("serialize graph request")?;
        self.invoke(&[], Some(payload))
    }
}

impl IntentClassifier for CommandCollaborator {
    fn classify(&self, query: &str) -> Result<IntentAnalysis> {
        self.invoke(&[query], None)
    }
}

impl Decomposer for CommandCollaborator {
    fn decompose(&self, query: &str, intent: &IntentAnalysis) -> Result<DecompositionPlan> {
        let payload = serde_json::to_vec(&json!({ "query": query, "intent": intent }))
            .context("serialize decompose request")?;
        self.invoke(&[], Some(payload))
    }
}
