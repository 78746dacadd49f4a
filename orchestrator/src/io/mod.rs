//! I/O adapters: agent process, operator console, collaborators, files.

pub mod agent;
pub mod cancel;
pub mod config;
pub mod context;
pub mod init;
pub mod operator;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod sink;
pub mod verify;
