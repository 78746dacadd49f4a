//! Sub-task plan invariants and execution ordering.
//!
//! The decomposition collaborator is expected to hand over dependency-ordered
//! sub-tasks. This module re-derives that order deterministically so a plan
//! whose listing is out of order still runs dependencies first.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::core::types::{DecompositionPlan, SubTask};

/// A plan that cannot be executed as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanInvariantError {
    pub violations: Vec<String>,
}

impl fmt::Display for PlanInvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan invariants failed: {}", self.violations.join("; "))
    }
}

impl std::error::Error for PlanInvariantError {}

/// Check plan invariants not expressible in JSON Schema:
/// - No duplicate or empty sub-task ids
/// - Every dependency names a sub-task in the plan
/// - No sub-task depends on itself
/// - `execution_plan` only names known sub-tasks
pub fn validate_plan(plan: &DecompositionPlan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for task in &plan.sub_tasks {
        if task.id.trim().is_empty() {
            errors.push("sub-task with empty id".to_string());
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate sub-task id '{}'", task.id));
        }
    }
    for task in &plan.sub_tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                errors.push(format!("sub-task '{}' depends on itself", task.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "sub-task '{}' depends on unknown sub-task '{}'",
                    task.id, dep
                ));
            }
        }
    }
    for id in &plan.execution_plan {
        if !seen.contains(id.as_str()) {
            errors.push(format!("execution plan names unknown sub-task '{id}'"));
        }
    }
    errors
}

/// Order sub-tasks so every dependency precedes its dependents.
///
/// Ties are broken by the supplier's preference: `execution_plan` order when
/// given, then listing order. Fails on invariant violations and on cycles.
pub fn execution_order(plan: &DecompositionPlan) -> Result<Vec<SubTask>, PlanInvariantError> {
    let violations = validate_plan(plan);
    if !violations.is_empty() {
        return Err(PlanInvariantError { violations });
    }

    let preference = preference_rank(plan);
    let mut remaining: Vec<&SubTask> = plan.sub_tasks.iter().collect();
    remaining.sort_by_key(|task| preference[task.id.as_str()]);

    let mut done: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|task| task.dependencies.iter().all(|d| done.contains(d.as_str())));
        let Some(idx) = ready else {
            let mut stuck: Vec<String> = remaining.iter().map(|t| t.id.clone()).collect();
            stuck.sort();
            return Err(PlanInvariantError {
                violations: vec![format!(
                    "dependency cycle among sub-tasks: {}",
                    stuck.join(", ")
                )],
            });
        };
        let task = remaining.remove(idx);
        done.insert(task.id.as_str());
        ordered.push(task.clone());
    }
    Ok(ordered)
}

fn preference_rank(plan: &DecompositionPlan) -> HashMap<&str, usize> {
    let mut rank = HashMap::new();
    for id in &plan.execution_plan {
        let next = rank.len();
        rank.entry(id.as_str()).or_insert(next);
    }
    for task in &plan.sub_tasks {
        let next = rank.len();
        rank.entry(task.id.as_str()).or_insert(next);
    }
    rank
}
