//! Post-apply verification (the configured build/test command).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::core::types::VerifyOutcome;
use crate::io::process::{Bounds, run_bounded};

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    /// Combined stdout/stderr is written here when set.
    pub log_path: Option<PathBuf>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

/// Runs an argv command; exit status 0 passes.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    pub argv: Vec<String>,
}

impl Verifier for CommandVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("verify command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        info!(command = %self.argv.join(" "), "running verification");

        let bounds = Bounds {
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
        };
        let output = run_bounded(cmd, None, bounds)
            .with_context(|| format!("run verify command `{program}`"))?;

        if let Some(path) = &request.log_path {
            let stdout = output.stdout.text() + &output.stdout.notice("stdout");
            let mut stderr = output.stderr.text() + &output.stderr.notice("stderr");
            if output.timed_out {
                stderr.push_str("\nverification timed out\n");
            }
            write_verify_log(
                path,
                stdout.as_bytes(),
                stderr.as_bytes(),
                request.output_limit_bytes,
            )?;
        }

        if output.succeeded() {
            Ok(VerifyOutcome::Pass)
        } else {
            warn!(
                exit_code = ?output.status.code(),
                timed_out = output.timed_out,
                "verification failed"
            );
            Ok(VerifyOutcome::Fail)
        }
    }
}

/// Verify only when something was modified and a verifier is configured.
pub fn run_verification_if_needed(
    files_modified: &[String],
    verifier: Option<&dyn Verifier>,
    request: &VerifyRequest,
) -> Result<VerifyOutcome> {
    match verifier {
        Some(verifier) if !files_modified.is_empty() => verifier.verify(request),
        _ => Ok(VerifyOutcome::Skipped),
    }
}

fn write_verify_log(path: &Path, stdout: &[u8], stderr: &[u8], output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(stdout));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(stderr));

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }

    fs::write(path, buf).with_context(|| format!("write verify log {}", path.display()))
}
