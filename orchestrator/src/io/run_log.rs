//! Run artifacts under `.orchestrator/runs/<run-id>/`.
//!
//! Layout:
//! ```text
//! runs/<run-id>/
//!   result.json
//!   verify.log
//!   task-<n>/
//!     report.json
//!     attempt-<k>/prompt.md
//!     attempt-<k>/phase1.jsonl
//!     attempt-<k>/phase2.jsonl
//! ```
//! These are product artifacts, written regardless of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{SubTaskReport, WorkflowResult};

/// Timestamped run id, unique per process.
pub fn new_run_id() -> String {
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    )
}

#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
}

impl RunLog {
    /// Create the run directory under `<root>/.orchestrator/runs/`.
    pub fn create(root: &Path, run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        let dir = root.join(".orchestrator").join("runs").join(&run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        debug!(dir = %dir.display(), "run log created");
        Ok(Self { run_id, dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log for the `index`-th task executed in this run (1-based).
    pub fn task(&self, index: usize) -> TaskLog {
        TaskLog {
            dir: self.dir.join(format!("task-{index}")),
        }
    }

    pub fn verify_log_path(&self) -> PathBuf {
        self.dir.join("verify.log")
    }

    pub fn write_result(&self, result: &WorkflowResult) -> Result<PathBuf> {
        let path = self.dir.join("result.json");
        write_json(&path, result)?;
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct TaskLog {
    dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub phase1_path: PathBuf,
    pub phase2_path: PathBuf,
}

impl TaskLog {
    pub fn attempt(&self, attempt: u32) -> AttemptPaths {
        let dir = self.dir.join(format!("attempt-{attempt}"));
        AttemptPaths {
            prompt_path: dir.join("prompt.md"),
            phase1_path: dir.join("phase1.jsonl"),
            phase2_path: dir.join("phase2.jsonl"),
            dir,
        }
    }

    pub fn write_prompt(&self, attempt: u32, prompt: &str) -> Result<PathBuf> {
        let paths = self.attempt(attempt);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;
        fs::write(&paths.prompt_path, prompt)
            .with_context(|| format!("write {}", paths.prompt_path.display()))?;
        Ok(paths.prompt_path)
    }

    pub fn write_report(&self, report: &SubTaskReport) -> Result<()> {
        write_json(&self.dir.join("report.json"), report)
    }
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))
}
