//! Bounded child processes for the verification command and the
//! command-backed collaborators.
//!
//! The agent itself is driven by `io::agent`, which needs streaming reads;
//! it shares only [`capture`] with this module.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

const CHUNK_BYTES: usize = 8192;

/// One output stream, cut at the byte limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes read past the limit and discarded.
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// `"[<label> truncated N bytes]"` line, or nothing when complete.
    pub fn notice(&self, label: &str) -> String {
        if self.is_truncated() {
            format!("\n[{label} truncated {} bytes]\n", self.dropped)
        } else {
            String::new()
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Limits applied to one [`run_bounded`] call.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Run `cmd` to completion or until `bounds.timeout`, whichever comes first.
///
/// stdin, stdout and stderr are each serviced on their own thread so a child
/// that fills one pipe while we block on another cannot stall.
#[instrument(skip_all, fields(timeout_secs = bounds.timeout.as_secs(), limit = bounds.output_limit_bytes))]
pub fn run_bounded(
    mut cmd: Command,
    input: Option<Vec<u8>>,
    bounds: Bounds,
) -> Result<CommandOutput> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn `{program}`"))?;
    debug!(program = %program, pid = child.id(), "spawned");

    if let Some(input) = input {
        feed_stdin(&mut child, input)?;
    }
    let stdout = reader(child.stdout.take(), bounds.output_limit_bytes)?;
    let stderr = reader(child.stderr.take(), bounds.output_limit_bytes)?;

    let (status, timed_out) = match child.wait_timeout(bounds.timeout).context("wait for child")? {
        Some(status) => (status, false),
        None => {
            warn!(program = %program, "timed out, killing");
            child.kill().context("kill child")?;
            (child.wait().context("reap child")?, true)
        }
    };

    let stdout = collect(stdout).context("collect stdout")?;
    let stderr = collect(stderr).context("collect stderr")?;
    if stdout.is_truncated() || stderr.is_truncated() {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn feed_stdin(child: &mut Child, input: Vec<u8>) -> Result<()> {
    let mut pipe = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    thread::spawn(move || {
        if let Err(err) = pipe.write_all(&input) {
            debug!(err = %err, "child closed stdin early");
        }
    });
    Ok(())
}

fn reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    limit: usize,
) -> Result<JoinHandle<Result<Captured>>> {
    let pipe = pipe.ok_or_else(|| anyhow!("output was not piped"))?;
    Ok(thread::spawn(move || capture(pipe, limit)))
}

fn collect(handle: JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?
}

/// Drain `reader` to EOF, keeping the first `limit` bytes.
pub(crate) fn capture<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut out = Captured::default();
    let mut chunk = [0u8; CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(out);
        }
        let keep = n.min(limit.saturating_sub(out.bytes.len()));
        out.bytes.extend_from_slice(&chunk[..keep]);
        out.dropped += n - keep;
    }
}
