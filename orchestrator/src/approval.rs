//! Approval gate between Phase 1 proposals and Phase 2 application.

use tracing::debug;

use crate::core::diff::render_changes;
use crate::core::types::{ApprovalDecision, ProposedChange, SessionPolicy};
use crate::io::operator::Operator;

const APPROVAL_OPTIONS: [&str; 3] = ["Approve", "Approve always", "Reject with feedback"];
const NO_CHANGE_OPTIONS: [&str; 2] = ["Provide more guidance", "Accept without changes"];

/// Operator's answer when a retry proposed no changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoChangeChoice {
    Guidance(String),
    Accept,
    Cancelled,
}

/// Ask the operator whether `changes` may be applied.
///
/// With `approve_all` set this returns [`ApprovalDecision::Approve`] without
/// any interaction. The caller owns the policy and flips `approve_all` when
/// the answer is [`ApprovalDecision::ApproveAlways`].
pub fn confirm(
    changes: &[ProposedChange],
    policy: SessionPolicy,
    operator: &mut dyn Operator,
) -> ApprovalDecision {
    if policy.approve_all {
        debug!(changes = changes.len(), "approve-all set, skipping gate");
        return ApprovalDecision::Approve;
    }

    operator.show(&render_changes(changes));
    match operator.choose("Apply these changes?", &APPROVAL_OPTIONS) {
        Some(0) => ApprovalDecision::Approve,
        Some(1) => ApprovalDecision::ApproveAlways,
        Some(_) => match ask_non_empty(operator, "What should be done differently?") {
            Some(feedback) => ApprovalDecision::RejectWithFeedback(feedback),
            None => ApprovalDecision::Cancelled,
        },
        None => ApprovalDecision::Cancelled,
    }
}

/// Secondary choice after a feedback retry that proposed nothing.
pub fn no_changes_follow_up(response: &str, operator: &mut dyn Operator) -> NoChangeChoice {
    let response = response.trim();
    if response.is_empty() {
        operator.show("The agent proposed no changes after your feedback.");
    } else {
        operator.show(&format!(
            "The agent proposed no changes after your feedback:\n\n{response}"
        ));
    }
    match operator.choose("How do you want to continue?", &NO_CHANGE_OPTIONS) {
        Some(0) => match ask_non_empty(operator, "What guidance should the agent follow?") {
            Some(guidance) => NoChangeChoice::Guidance(guidance),
            None => NoChangeChoice::Cancelled,
        },
        Some(_) => NoChangeChoice::Accept,
        None => NoChangeChoice::Cancelled,
    }
}

/// Re-ask until the operator types something or interrupts.
fn ask_non_empty(operator: &mut dyn Operator, question: &str) -> Option<String> {
    loop {
        let answer = operator.ask_text(question)?;
        let answer = answer.trim();
        if !answer.is_empty() {
            return Some(answer.to_string());
        }
        operator.show("Feedback must not be empty.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChangeTool;
    use crate::test_support::{Reply, ScriptedOperator};

    fn changes() -> Vec<ProposedChange> {
        vec![ProposedChange {
            tool: ChangeTool::Edit,
            file_path: "src/a.rs".to_string(),
            content: None,
            old_text: Some("old".to_string()),
            new_text: Some("new".to_string()),
        }]
    }

    #[test]
    fn approve_all_short_circuits_without_prompting() {
        let mut operator = ScriptedOperator::default();
        let policy = SessionPolicy {
            approve_all: true,
            verbose: false,
        };
        assert_eq!(
            confirm(&changes(), policy, &mut operator),
            ApprovalDecision::Approve
        );
        assert!(operator.shown.is_empty());
        assert!(operator.questions.is_empty());
    }

    #[test]
    fn renders_diff_before_asking() {
        let mut operator = ScriptedOperator::new([Reply::Choose(1)]);
        let decision = confirm(&changes(), SessionPolicy::default(), &mut operator);
        assert_eq!(decision, ApprovalDecision::ApproveAlways);
        assert!(operator.shown[0].contains("--- src/a.rs\n+++ src/a.rs\n- old\n+ new\n"));
    }

    #[test]
    fn rejection_requires_non_empty_feedback() {
        let mut operator = ScriptedOperator::new([
            Reply::Choose(2),
            Reply::Text("   ".to_string()),
            Reply::Text("use a trait".to_string()),
        ]);
        let decision = confirm(&changes(), SessionPolicy::default(), &mut operator);
        assert_eq!(
            decision,
            ApprovalDecision::RejectWithFeedback("use a trait".to_string())
        );
        assert_eq!(operator.questions.len(), 3);
    }

    #[test]
    fn interrupt_cancels() {
        let mut operator = ScriptedOperator::new([Reply::Interrupt]);
        assert_eq!(
            confirm(&changes(), SessionPolicy::default(), &mut operator),
            ApprovalDecision::Cancelled
        );

        let mut operator = ScriptedOperator::new([Reply::Choose(2), Reply::Interrupt]);
        assert_eq!(
            confirm(&changes(), SessionPolicy::default(), &mut operator),
            ApprovalDecision::Cancelled
        );
    }

    #[test]
    fn follow_up_offers_guidance_or_accept() {
        let mut operator =
            ScriptedOperator::new([Reply::Choose(0), Reply::Text("look in src/".to_string())]);
        assert_eq!(
            no_changes_follow_up("Nothing to do.", &mut operator),
            NoChangeChoice::Guidance("look in src/".to_string())
        );
        assert!(operator.shown[0].contains("Nothing to do."));

        let mut operator = ScriptedOperator::new([Reply::Choose(1)]);
        assert_eq!(
            no_changes_follow_up("", &mut operator),
            NoChangeChoice::Accept
        );
    }
}
