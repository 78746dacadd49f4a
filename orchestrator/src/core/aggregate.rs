//! Merge per-task outcomes into one workflow result.

use std::collections::HashSet;

use crate::core::types::{
    ContextTotals, Entity, GraphAnalysis, Relationship, SearchHit, SubTaskReport, TaskOutcome,
    VerifyOutcome, WorkflowResult,
};

/// Retrieval and graph artifacts accumulated across sub-tasks for the report.
///
/// Search hits collapse by file path and entities by name; relationships are
/// kept as supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextArtifacts {
    pub hits: Vec<SearchHit>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl ContextArtifacts {
    pub fn absorb(&mut self, hits: &[SearchHit], graph: &GraphAnalysis) {
        for hit in hits {
            if !self.hits.iter().any(|h| h.file == hit.file) {
                self.hits.push(hit.clone());
            }
        }
        for entity in &graph.entities {
            if !self.entities.iter().any(|e| e.name == entity.name) {
                self.entities.push(entity.clone());
            }
        }
        self.relationships.extend(graph.relationships.iter().cloned());
    }

    pub fn totals(&self) -> ContextTotals {
        ContextTotals {
            search_hits: self.hits.len(),
            entities: self.entities.len(),
            relationships: self.relationships.len(),
        }
    }
}

/// Running merge of task outcomes in execution order.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    responses: Vec<String>,
    files: Vec<String>,
    seen_files: HashSet<String>,
    reports: Vec<SubTaskReport>,
    summaries: Vec<String>,
    pub artifacts: ContextArtifacts,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one task. `header` is `Some` when the request was decomposed.
    pub fn record(
        &mut self,
        id: &str,
        description: &str,
        header: Option<&str>,
        outcome: &TaskOutcome,
    ) {
        let body = outcome.response.trim();
        match header {
            Some(header) => self.responses.push(format!("{header}\n\n{body}")),
            None => self.responses.push(body.to_string()),
        }
        for file in &outcome.files_modified {
            if self.seen_files.insert(file.clone()) {
                self.files.push(file.clone());
            }
        }
        self.summaries.push(outcome.summary.clone());
        self.reports.push(SubTaskReport {
            id: id.to_string(),
            description: description.to_string(),
            terminal: outcome.terminal.clone(),
            attempts: outcome.attempts,
            files_modified: outcome.files_modified.clone(),
        });
    }

    pub fn files_modified(&self) -> &[String] {
        &self.files
    }

    pub fn is_halted(&self) -> bool {
        self.reports
            .last()
            .is_some_and(|report| report.terminal.halts_workflow())
    }

    /// Produce the final result. `planned` is the number of tasks scheduled.
    pub fn finish(
        self,
        run_id: Option<String>,
        planned: usize,
        verification: Option<VerifyOutcome>,
    ) -> WorkflowResult {
        let all_succeeded =
            !self.reports.is_empty() && self.reports.iter().all(|r| r.terminal.is_success());
        let verified = verification != Some(VerifyOutcome::Fail);
        let success = all_succeeded && self.reports.len() == planned && verified;

        let error = self.reports.iter().find_map(|report| {
            report.terminal.hard_error().map(|err| {
                if planned > 1 {
                    format!("sub-task {}: {err}", report.id)
                } else {
                    err
                }
            })
        });

        let summary = self.combined_summary(planned, verification);
        WorkflowResult {
            run_id,
            success,
            files_modified: self.files,
            response: self.responses.join("\n\n"),
            summary,
            error,
            verification,
            sub_tasks: self.reports,
            context: self.artifacts.totals(),
        }
    }

    fn combined_summary(&self, planned: usize, verification: Option<VerifyOutcome>) -> String {
        let mut lines = Vec::new();
        if planned <= 1 {
            if let Some(only) = self.summaries.first() {
                lines.push(only.clone());
            }
        } else {
            let completed = self
                .reports
                .iter()
                .filter(|r| r.terminal.is_success())
                .count();
            lines.push(format!(
                "Completed {completed}/{planned} sub-tasks; {} file(s) modified.",
                self.files.len()
            ));
            for (report, summary) in self.reports.iter().zip(&self.summaries) {
                lines.push(format!("- [{}] {}", report.id, summary));
            }
            if self.reports.len() < planned {
                if let Some(last) = self.reports.last() {
                    lines.push(format!(
                        "Stopped after sub-task {}; {} sub-task(s) not run.",
                        last.id,
                        planned - self.reports.len()
                    ));
                }
            }
        }
        match verification {
            Some(VerifyOutcome::Pass) => lines.push("Verification passed.".to_string()),
            Some(VerifyOutcome::Fail) => lines.push("Verification failed.".to_string()),
            Some(VerifyOutcome::Skipped) | None => {}
        }
        lines.join("\n")
    }
}
