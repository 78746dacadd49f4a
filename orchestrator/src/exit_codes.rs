//! Stable exit codes for orchestrator CLI commands.

use crate::core::types::WorkflowResult;

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config/plan/project, or a hard failure before any sub-task ran.
pub const INVALID: i32 = 1;
/// `orchestrator run` completed but did not succeed.
pub const INCOMPLETE: i32 = 2;
/// Interrupted by the operator.
pub const CANCELLED: i32 = 130;

/// Exit code for a finished `orchestrator run`.
pub fn for_result(result: &WorkflowResult, cancelled: bool) -> i32 {
    if cancelled {
        CANCELLED
    } else if result.success {
        OK
    } else if result.sub_tasks.is_empty() && result.error.is_some() {
        INVALID
    } else {
        INCOMPLETE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SubTaskReport, TaskTerminal};

    #[test]
    fn maps_results_to_codes() {
        let failed = WorkflowResult::failed(None, "plan invariants failed");
        assert_eq!(for_result(&failed, false), INVALID);
        assert_eq!(for_result(&failed, true), CANCELLED);

        let mut partial = failed.clone();
        partial.sub_tasks.push(SubTaskReport {
            id: "1".to_string(),
            description: "one".to_string(),
            terminal: TaskTerminal::IterationsExhausted,
            attempts: 10,
            files_modified: Vec::new(),
        });
        assert_eq!(for_result(&partial, false), INCOMPLETE);

        partial.success = true;
        partial.error = None;
        assert_eq!(for_result(&partial, false), OK);
    }
}
