//! Prompt rewriting for the feedback retry loop.

/// Default bound on Phase 1 attempts per task.
pub const MAX_ITERATIONS: u32 = 10;

/// Append a delimited feedback block to the *original* prompt.
///
/// Callers must always pass the unmodified original prompt: each retry carries
/// only the latest feedback, so prompts never compound across iterations.
pub fn feedback_prompt(original: &str, feedback: &str, iteration: u32) -> String {
    let mut prompt = String::with_capacity(original.len() + feedback.len() + 256);
    prompt.push_str(original);
    if !original.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\n### User Feedback (iteration {iteration})\n\
         <user_feedback iteration=\"{iteration}\">\n"
    ));
    prompt.push_str(feedback);
    if !feedback.ends_with('\n') {
        prompt.push('\n');
    }
    prompt.push_str(
        "</user_feedback>\n\n\
         The operator reviewed your previous proposal and did not approve it. \
         Revise the proposed changes to address the feedback above.\n",
    );
    prompt
}
