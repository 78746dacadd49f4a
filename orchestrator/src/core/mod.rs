//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (stream bytes, denial records, plans, task outcomes) and return
//! deterministic outputs suitable for tests.

pub mod aggregate;
pub mod diff;
pub mod feedback;
pub mod plan;
pub mod proposals;
pub mod stream;
pub mod types;
