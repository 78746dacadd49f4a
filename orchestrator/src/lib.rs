//! Human-in-the-loop orchestrator for an external AI code-modification agent.
//!
//! A request is classified, optionally decomposed into ordered sub-tasks, and
//! each task is driven through two agent phases: an unprivileged analysis whose
//! denied file writes become proposals, and, once the operator approves, a
//! resumed session that applies them. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (stream decoding, proposal
//!   extraction, plan ordering, aggregation). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (agent process, console, collaborator
//!   commands, run logs). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`approval`], [`execution`], [`workflow`]) coordinate
//! core logic with I/O to implement the `run` command.

pub mod approval;
pub mod core;
pub mod execution;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
