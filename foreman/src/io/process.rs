//! Bounded execution of short-lived helper commands (`tmux`, `git`).
//!
//! Helper commands should return almost instantly; a hung helper must not hang
//! the supervision loop, so every call carries a timeout and an output cap.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Output of a finished (or killed) helper command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|status| status.success())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn a failed or timed-out run into an error labelled with `label`.
    pub fn check(self, label: &str) -> Result<Self> {
        if self.timed_out {
            return Err(anyhow!("{label} timed out"));
        }
        if !self.success() {
            return Err(anyhow!(
                "{label} failed (status {:?}): {}",
                self.status.and_then(|status| status.code()),
                self.stderr_text()
            ));
        }
        Ok(self)
    }
}

/// Run `cmd` with stdin closed, killing it after `timeout`.
///
/// stdout/stderr are drained on reader threads so a chatty child cannot block on
/// a full pipe; at most `output_limit_bytes` of each stream are kept.
pub fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().to_string();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {program}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let (status, timed_out) = match child
        .wait_timeout(timeout)
        .with_context(|| format!("wait for {program}"))?
    {
        Some(status) => (Some(status), false),
        None => {
            warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "helper command timed out, killing");
            child.kill().with_context(|| format!("kill {program}"))?;
            let status = child.wait().ok();
            (status, true)
        }
    };

    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;
    debug!(program = %program, exit_code = ?status.and_then(|s| s.code()), timed_out, "helper command finished");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(kept)
}
