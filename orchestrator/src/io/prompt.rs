//! Prompt builder for the Phase 1 agent input.
//!
//! The template marks each section with `<!-- section:KEY required|droppable -->`.
//! After rendering, sections are split on those markers and droppable ones are
//! removed (lowest priority first) until the prompt fits the byte budget.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{GraphAnalysis, IntentAnalysis, SearchHit, SubTask};

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Droppable sections in the order they are given up.
const DROP_ORDER: [&str; 5] = ["graph", "files", "intent", "completed", "clarifications"];

/// An operator answer to one clarification question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Clarification {
    pub question: String,
    pub answer: String,
}

/// All inputs needed to render one task prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub project: String,
    /// The operator's original request.
    pub request: String,
    /// Set when the request was decomposed.
    pub sub_task: Option<SubTask>,
    pub intent: Option<IntentAnalysis>,
    pub clarifications: Vec<Clarification>,
    /// One line per sub-task already finished in this run.
    pub completed: Vec<String>,
    pub hits: Vec<SearchHit>,
    pub graph: GraphAnalysis,
}

#[derive(Serialize)]
struct TaskView<'a> {
    id: &'a str,
    kind: &'a str,
    description: &'a str,
}

#[derive(Serialize)]
struct IntentView<'a> {
    kind: &'a str,
    confidence: String,
    assumptions: &'a [String],
}

#[derive(Serialize)]
struct FileView<'a> {
    path: &'a str,
    kind: &'a str,
    score: String,
    snippet: &'a str,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders task prompts within a byte budget.
#[derive(Debug)]
pub struct PromptBuilder {
    budget_bytes: usize,
    env: Environment<'static>,
    marker: Regex,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .context("compile task template")?;
        let marker = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .context("compile section marker")?;
        Ok(Self {
            budget_bytes,
            env,
            marker,
        })
    }

    pub fn build(&self, input: &PromptInputs) -> Result<String> {
        let rendered = self.render(input)?;
        let mut sections = self.parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    fn render(&self, input: &PromptInputs) -> Result<String> {
        let task = input.sub_task.as_ref().map(|task| TaskView {
            id: &task.id,
            kind: &task.task_type,
            description: task.description.trim(),
        });
        let intent = input.intent.as_ref().map(|intent| IntentView {
            kind: &intent.intent,
            confidence: format!("{:.2}", intent.confidence),
            assumptions: &intent.assumptions,
        });
        let files: Vec<FileView<'_>> = input
            .hits
            .iter()
            .map(|hit| FileView {
                path: &hit.file,
                kind: if hit.kind.is_empty() { "file" } else { hit.kind.as_str() },
                score: format!("{:.2}", hit.similarity_score),
                snippet: hit.snippet.trim_end(),
            })
            .collect();
        let relationships: Vec<String> = input
            .graph
            .relationships
            .iter()
            .map(|rel| {
                let mut line = format!(
                    "{} --{}--> {}",
                    rel.from_entity, rel.relation_type, rel.to_entity
                );
                if !rel.locations.is_empty() {
                    line.push_str(&format!(" ({})", rel.locations.join(", ")));
                }
                line
            })
            .collect();

        let template = self.env.get_template("task")?;
        let rendered = template
            .render(context! {
                project => input.project,
                request => input.request.trim(),
                task => task,
                intent => intent,
                clarifications => input.clarifications,
                completed => input.completed,
                files => files,
                relationships => relationships,
                packages => input.graph.packages,
            })
            .context("render task prompt")?;
        Ok(rendered)
    }

    fn parse_sections(&self, rendered: &str) -> Vec<ParsedSection> {
        let markers: Vec<_> = self.marker.captures_iter(rendered).collect();
        let mut sections = Vec::with_capacity(markers.len());
        for (i, caps) in markers.iter().enumerate() {
            let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(rendered.len(), |m| m.start());
            let content = rendered[whole.end()..end].trim().to_string();
            let required = kind.as_str() == "required";
            if !content.is_empty() || required {
                sections.push(ParsedSection {
                    key: key.as_str().to_string(),
                    required,
                    content,
                });
            }
        }
        sections
    }
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in [`DROP_ORDER`] until the prompt fits.
///
/// Required sections are never dropped or truncated: the task text always
/// reaches the agent even if it alone exceeds the budget.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Relationship;

    fn inputs() -> PromptInputs {
        PromptInputs {
            project: "/work/app".to_string(),
            request: "Add rate limiting to the login route".to_string(),
            sub_task: None,
            intent: Some(IntentAnalysis {
                intent: "modify".to_string(),
                confidence: 0.824,
                assumptions: vec!["Redis is available".to_string()],
                ambiguities: Vec::new(),
            }),
            clarifications: vec![Clarification {
                question: "Which limit?".to_string(),
                answer: "5 per minute".to_string(),
            }],
            completed: Vec::new(),
            hits: vec![SearchHit {
                file: "src/routes/login.ts".to_string(),
                kind: "code".to_string(),
                similarity_score: 0.91,
                snippet: "export function login() {}".to_string(),
            }],
            graph: GraphAnalysis {
                entities: Vec::new(),
                relationships: vec![Relationship {
                    from_entity: "login".to_string(),
                    to_entity: "session".to_string(),
                    relation_type: "calls".to_string(),
                    locations: vec!["src/routes/login.ts:12".to_string()],
                }],
                packages: vec!["express".to_string()],
            },
        }
    }

    /// Verifies sections render in a stable order with their content.
    #[test]
    fn prompt_ordering_is_stable() {
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build(&inputs())
            .expect("build");

        let positions: Vec<usize> = [
            "### Working Agreement",
            "### Task",
            "### Clarifications",
            "### Intent",
            "### Relevant Files",
            "### Code Relationships",
        ]
        .iter()
        .map(|header| prompt.find(header).expect(header))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{prompt}");

        assert!(prompt.contains("`/work/app`"));
        assert!(prompt.contains("- Q: Which limit?\n  A: 5 per minute"));
        assert!(prompt.contains("Classified as `modify` (confidence 0.82)."));
        assert!(prompt.contains("- `src/routes/login.ts` (code, score 0.91)"));
        assert!(prompt.contains("login --calls--> session (src/routes/login.ts:12)"));
        assert!(prompt.contains("Packages: express"));
        assert!(!prompt.contains("<!--"));
    }

    /// Verifies empty optional context produces no headers.
    #[test]
    fn empty_context_sections_are_omitted() {
        let input = PromptInputs {
            project: ".".to_string(),
            request: "Fix the typo in README".to_string(),
            ..PromptInputs::default()
        };
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build(&input)
            .expect("build");
        assert!(prompt.contains("### Task\nFix the typo in README"));
        assert!(!prompt.contains("### Relevant Files"));
        assert!(!prompt.contains("### Intent"));
        assert!(!prompt.contains("### Clarifications"));
    }

    /// Verifies sub-task prompts carry both the sub-task and the overall request.
    #[test]
    fn sub_task_prompt_names_the_overall_request() {
        let mut input = inputs();
        input.sub_task = Some(SubTask {
            id: "2".to_string(),
            task_type: "test".to_string(),
            description: "Add tests for the limiter".to_string(),
            search_terms: Vec::new(),
            dependencies: vec!["1".to_string()],
            context_filter: None,
        });
        input.completed = vec!["[1] Applied 1 change(s): src/limiter.ts".to_string()];
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build(&input)
            .expect("build");
        assert!(prompt.contains("Sub-task 2 (test) of a larger request."));
        assert!(prompt.contains("Overall request: Add rate limiting to the login route"));
        assert!(prompt.contains("### Completed Sub-tasks\n- [1] Applied 1 change(s)"));
    }

    /// Verifies budget enforcement drops graph and file context before clarifications.
    #[test]
    fn budget_drops_less_critical_sections_first() {
        let mut input = inputs();
        input.hits[0].snippet = "x".repeat(2_000);
        let full = PromptBuilder::new(100_000)
            .expect("builder")
            .build(&input)
            .expect("build");
        let budget = full.len() - 1_500;

        let prompt = PromptBuilder::new(budget)
            .expect("builder")
            .build(&input)
            .expect("build");
        assert!(!prompt.contains("### Code Relationships"));
        assert!(!prompt.contains("### Relevant Files"));
        assert!(prompt.contains("### Intent"));
        assert!(prompt.contains("### Clarifications"));
        assert!(prompt.contains("### Task"));
    }

    /// Verifies required sections survive even a tiny budget.
    #[test]
    fn required_sections_are_never_dropped() {
        let prompt = PromptBuilder::new(10)
            .expect("builder")
            .build(&inputs())
            .expect("build");
        assert!(prompt.contains("### Working Agreement"));
        assert!(prompt.contains("Add rate limiting to the login route"));
        assert!(!prompt.contains("### Clarifications"));
    }
}
