//! Persistent terminal sessions hosting the worker process.
//!
//! The [`SessionHost`] trait is the only surface the supervisor needs from a
//! terminal multiplexer: create/attach, read recent output, send input, kill.
//! [`TmuxHost`] drives `tmux`; tests use scripted hosts that replay output.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::types::SessionState;
use crate::error::ForemanError;
use crate::io::process::run_bounded;

const HOST_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Abstraction over terminal session backends.
pub trait SessionHost {
    /// Verify the host is usable; returns a version or description string.
    fn check(&self) -> Result<String>;
    fn has_session(&self, name: &str) -> Result<bool>;
    /// Start `command` detached in a new session named `name`, rooted at `workdir`.
    fn create(&self, name: &str, workdir: &Path, command: &[String]) -> Result<()>;
    /// Most recent output, at least the last `lines` lines when available.
    fn capture(&self, name: &str, lines: usize) -> Result<String>;
    /// Type `text` and submit it. An empty `text` submits a bare Enter.
    fn send(&self, name: &str, text: &str) -> Result<()>;
    /// Terminate the session. Killing a missing session is not an error.
    fn kill(&self, name: &str) -> Result<()>;
}

/// Session host backed by `tmux`.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    command_timeout: Duration,
    submit_delay: Duration,
}

impl TmuxHost {
    pub fn new(command_timeout: Duration, submit_delay: Duration) -> Self {
        Self {
            command_timeout,
            submit_delay,
        }
    }

    fn tmux(&self, args: &[&str]) -> Result<crate::io::process::CommandOutput> {
        let mut cmd = Command::new("tmux");
        cmd.args(args);
        run_bounded(cmd, self.command_timeout, HOST_OUTPUT_LIMIT_BYTES)
    }

    fn tmux_checked(&self, args: &[&str]) -> Result<crate::io::process::CommandOutput> {
        let label = format!("tmux {}", args.first().copied().unwrap_or_default());
        self.tmux(args)?.check(&label)
    }
}

/// Exact-match session target (`=name`), so `foo` never matches `foo-bar`.
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// Active pane of the session's current window.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

impl SessionHost for TmuxHost {
    fn check(&self) -> Result<String> {
        let out = self.tmux_checked(&["-V"])?;
        Ok(out.stdout_text().trim().to_string())
    }

    fn has_session(&self, name: &str) -> Result<bool> {
        let out = self.tmux(&["has-session", "-t", &session_target(name)])?;
        if out.timed_out {
            return Err(anyhow!("tmux has-session timed out"));
        }
        Ok(out.success())
    }

    #[instrument(skip_all, fields(session = name, workdir = %workdir.display()))]
    fn create(&self, name: &str, workdir: &Path, command: &[String]) -> Result<()> {
        let workdir = workdir
            .to_str()
            .ok_or_else(|| anyhow!("workdir is not valid UTF-8: {}", workdir.display()))?;
        let mut args = vec![
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            workdir,
            "-x",
            "200",
            "-y",
            "50",
            "--",
        ];
        args.extend(command.iter().map(String::as_str));
        self.tmux_checked(&args)?;
        debug!("tmux session created");
        Ok(())
    }

    fn capture(&self, name: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        let out =
            self.tmux_checked(&["capture-pane", "-p", "-J", "-t", &pane_target(name), "-S", &start])?;
        Ok(tail_lines(&out.stdout_text(), lines))
    }

    fn send(&self, name: &str, text: &str) -> Result<()> {
        let target = pane_target(name);
        if !text.is_empty() {
            self.tmux_checked(&["send-keys", "-t", &target, "-l", "--", text])?;
            std::thread::sleep(self.submit_delay);
        }
        self.tmux_checked(&["send-keys", "-t", &target, "Enter"])?;
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<()> {
        if !self.has_session(name)? {
            return Ok(());
        }
        self.tmux_checked(&["kill-session", "-t", &session_target(name)])?;
        Ok(())
    }
}

/// Last `lines` lines of `text`, ignoring trailing blank pane rows.
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let end = all
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map_or(0, |idx| idx + 1);
    let start = end.saturating_sub(lines);
    let mut out = all[start..end].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Handle to one worker session, persisted with the task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session name, unique per task.
    pub id: String,
    /// Host-specific target used for capture/send.
    pub handle: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
    /// True when `start` found a live session instead of creating one.
    #[serde(default)]
    pub attached: bool,
}

impl Session {
    pub fn attach_hint(&self) -> String {
        format!("tmux attach -t {}", self.id)
    }
}

/// Owns session state transitions on top of a [`SessionHost`].
pub struct SessionManager<'a> {
    host: &'a dyn SessionHost,
}

impl<'a> SessionManager<'a> {
    pub fn new(host: &'a dyn SessionHost) -> Self {
        Self { host }
    }

    /// Start the worker in `workdir`, or attach to a live session named `name`.
    #[instrument(skip_all, fields(session = name))]
    pub fn start(&self, name: &str, workdir: &Path, command: &[String]) -> Result<Session> {
        let version = self
            .host
            .check()
            .map_err(ForemanError::session_unavailable)?;
        debug!(host = %version, "session host available");

        let attached = self
            .host
            .has_session(name)
            .map_err(ForemanError::session_unavailable)?;
        if attached {
            info!("attaching to existing session");
        } else {
            self.host
                .create(name, workdir, command)
                .map_err(ForemanError::session_unavailable)?;
            info!(command = %command.join(" "), "session started");
        }

        let now = Utc::now();
        Ok(Session {
            id: name.to_string(),
            handle: pane_target(name),
            created_at: now,
            last_activity_at: now,
            state: SessionState::Starting,
            attached,
        })
    }

    /// Read the last `lines` lines without blocking on the worker.
    pub fn capture(&self, session: &Session, lines: usize) -> Result<String> {
        self.host
            .capture(&session.id, lines)
            .with_context(|| format!("capture session {}", session.id))
    }

    /// Send one line of input followed by a submit.
    pub fn send(&self, session: &mut Session, text: &str) -> Result<()> {
        self.host
            .send(&session.id, text)
            .with_context(|| format!("send to session {}", session.id))?;
        session.last_activity_at = Utc::now();
        if session.state == SessionState::Ready {
            session.state = SessionState::Busy;
        }
        Ok(())
    }

    pub fn set_state(&self, session: &mut Session, state: SessionState) {
        if session.state != state {
            debug!(session = %session.id, from = ?session.state, to = ?state, "session state");
            session.state = state;
        }
    }

    /// Check liveness; a vanished session is marked terminated.
    pub fn is_alive(&self, session: &mut Session) -> Result<bool> {
        let alive = self
            .host
            .has_session(&session.id)
            .with_context(|| format!("query session {}", session.id))?;
        if !alive {
            self.set_state(session, SessionState::Terminated);
        }
        Ok(alive)
    }

    /// Kill the session if it is still running.
    pub fn terminate(&self, session: &mut Session) -> Result<()> {
        self.host
            .kill(&session.id)
            .with_context(|| format!("kill session {}", session.id))?;
        self.set_state(session, SessionState::Terminated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedHost;

    #[test]
    fn tail_lines_drops_blank_rows_and_keeps_the_end() {
        let pane = "one\ntwo\nthree\n\n   \n\n";
        assert_eq!(tail_lines(pane, 2), "two\nthree\n");
        assert_eq!(tail_lines(pane, 10), "one\ntwo\nthree\n");
        assert_eq!(tail_lines("\n\n", 5), "");
    }

    #[test]
    fn start_creates_then_attaches() {
        let host = ScriptedHost::new(vec!["> "]);
        let manager = SessionManager::new(&host);
        let dir = tempfile::tempdir().expect("tempdir");
        let command = vec!["worker".to_string()];

        let first = manager.start("foreman-t", dir.path(), &command).expect("start");
        assert!(!first.attached);
        assert_eq!(first.state, SessionState::Starting);

        let second = manager.start("foreman-t", dir.path(), &command).expect("start");
        assert!(second.attached);
        assert_eq!(host.created(), vec!["foreman-t".to_string()]);
    }

    #[test]
    fn unavailable_host_is_a_typed_error() {
        let host = ScriptedHost::new(Vec::<&str>::new()).unavailable();
        let manager = SessionManager::new(&host);
        let dir = tempfile::tempdir().expect("tempdir");
        let err = manager
            .start("foreman-t", dir.path(), &["worker".to_string()])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForemanError>(),
            Some(ForemanError::SessionUnavailable { .. })
        ));
    }

    #[test]
    fn send_marks_ready_session_busy() {
        let host = ScriptedHost::new(vec!["> "]);
        let manager = SessionManager::new(&host);
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session = manager
            .start("foreman-t", dir.path(), &["worker".to_string()])
            .expect("start");
        manager.set_state(&mut session, SessionState::Ready);
        manager.send(&mut session, "begin").expect("send");
        assert_eq!(session.state, SessionState::Busy);
        assert_eq!(host.sent(), vec!["begin".to_string()]);

        manager.terminate(&mut session).expect("terminate");
        assert_eq!(session.state, SessionState::Terminated);
        assert!(!manager.is_alive(&mut session).expect("alive"));
    }
}
