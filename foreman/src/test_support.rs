//! Test-only doubles: throwaway git repositories, scripted session hosts, a
//! simulated worker and a manual clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tempfile::TempDir;

use crate::coordinator::RunObserver;
use crate::io::clock::Clock;
use crate::io::session::{SessionHost, tail_lines};
use crate::io::workspace::WorkspaceLayout;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A git repository with one commit, plus a sibling directory for worktrees.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
    workspaces: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let base = temp.path().canonicalize().context("canonicalize tempdir")?;
        let root = base.join("repo");
        fs::create_dir_all(&root).context("create repo dir")?;
        let repo = Self {
            _temp: temp,
            workspaces: base.join("trees"),
            root,
        };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "foreman@example.com"])?;
        repo.git(&["config", "user.name", "Foreman Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.root.join("README.md"), "fixture\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-q", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory for task worktrees, outside the repository.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.workspaces.clone()
    }

    /// Run `git` in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Default)]
struct HostLog {
    cursor: usize,
    live: Vec<String>,
    created: Vec<String>,
    sent: Vec<String>,
    killed: Vec<String>,
}

/// Session host that replays fixed output frames.
///
/// Each `capture` returns the next frame; the last frame repeats forever.
#[derive(Debug)]
pub struct ScriptedHost {
    frames: Vec<String>,
    available: bool,
    log: Mutex<HostLog>,
}

impl ScriptedHost {
    pub fn new<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            available: true,
            log: Mutex::new(HostLog::default()),
        }
    }

    /// Make `check` fail as if the multiplexer were not installed.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.log).sent.clone()
    }

    pub fn created(&self) -> Vec<String> {
        lock(&self.log).created.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        lock(&self.log).killed.clone()
    }

    pub fn live_sessions(&self) -> Vec<String> {
        lock(&self.log).live.clone()
    }

    /// Simulate the worker process exiting on its own.
    pub fn end_session(&self, name: &str) {
        lock(&self.log).live.retain(|live| live != name);
    }
}

impl SessionHost for ScriptedHost {
    fn check(&self) -> Result<String> {
        if self.available {
            Ok("scripted".to_string())
        } else {
            Err(anyhow!("tmux: command not found"))
        }
    }

    fn has_session(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.log).live.iter().any(|live| live == name))
    }

    fn create(&self, name: &str, _workdir: &Path, _command: &[String]) -> Result<()> {
        let mut log = lock(&self.log);
        log.live.push(name.to_string());
        log.created.push(name.to_string());
        Ok(())
    }

    fn capture(&self, name: &str, _lines: usize) -> Result<String> {
        let mut log = lock(&self.log);
        if !log.live.iter().any(|live| live == name) {
            return Err(anyhow!("can't find session: {name}"));
        }
        let index = log.cursor.min(self.frames.len().saturating_sub(1));
        log.cursor += 1;
        Ok(self.frames.get(index).cloned().unwrap_or_default())
    }

    fn send(&self, name: &str, text: &str) -> Result<()> {
        let mut log = lock(&self.log);
        if !log.live.iter().any(|live| live == name) {
            return Err(anyhow!("can't find session: {name}"));
        }
        log.sent.push(text.to_string());
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<()> {
        let mut log = lock(&self.log);
        let before = log.live.len();
        log.live.retain(|live| live != name);
        if log.live.len() != before {
            log.killed.push(name.to_string());
        }
        Ok(())
    }
}

const READY_PROMPT: &str = "❯ ";
const TRUST_PROMPT: &str = "Do you trust the files in this folder?";

#[derive(Debug, Default)]
struct WorkerState {
    output: String,
    live: Vec<String>,
    workdir: Option<PathBuf>,
    awaiting_trust: bool,
    directives: Vec<String>,
    sent: Vec<String>,
    killed: Vec<String>,
}

/// Session host that behaves like a cooperative worker.
///
/// Every phase directive it receives is answered with a completion signal,
/// either printed to the output or written as a report file. Scores come from
/// per-phase queues (the last value repeats; the default is 95).
#[derive(Debug)]
pub struct SimulatedWorker {
    directive: Regex,
    scores: Mutex<HashMap<String, VecDeque<u8>>>,
    silent: HashSet<String>,
    trust_prompt: bool,
    report_files: bool,
    state: Mutex<WorkerState>,
}

impl Default for SimulatedWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedWorker {
    pub fn new() -> Self {
        Self {
            directive: Regex::new(
                r"reports/(?P<phase>[a-z0-9_-]+)\.json with run (?P<run>[0-9a-f]+) and attempt (?P<attempt>\d+)",
            )
                .expect("directive regex"),
            scores: Mutex::new(HashMap::new()),
            silent: HashSet::new(),
            trust_prompt: false,
            report_files: false,
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn with_scores(self, phase: &str, scores: &[u8]) -> Self {
        lock(&self.scores).insert(phase.to_string(), scores.iter().copied().collect());
        self
    }

    /// Never signal completion for `phase`.
    pub fn silent(mut self, phase: &str) -> Self {
        self.silent.insert(phase.to_string());
        self
    }

    /// Ask the folder-trust question before showing the input prompt.
    pub fn with_trust_prompt(mut self) -> Self {
        self.trust_prompt = true;
        self
    }

    /// Signal completion through `.foreman/reports/<phase>.json` instead of output lines.
    pub fn with_report_files(mut self) -> Self {
        self.report_files = true;
        self
    }

    /// Phase directives received, in order.
    pub fn directives(&self) -> Vec<String> {
        lock(&self.state).directives.clone()
    }

    /// Everything typed into the session, including prompt answers.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.state).sent.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        lock(&self.state).killed.clone()
    }

    /// Append `line` to the session output as if the worker printed it.
    pub fn print(&self, line: &str) {
        let mut state = lock(&self.state);
        state.output.push_str(line);
        state.output.push('\n');
    }

    /// Simulate the worker process exiting.
    pub fn end_session(&self) {
        lock(&self.state).live.clear();
    }

    fn next_score(&self, phase: &str) -> u8 {
        let mut scores = lock(&self.scores);
        match scores.get_mut(phase) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(95),
            Some(queue) => queue.front().copied().unwrap_or(95),
            None => 95,
        }
    }

    fn complete(&self, state: &mut WorkerState, run: &str, phase: &str, attempt: u32) -> Result<()> {
        let score = self.next_score(phase);
        if self.report_files {
            let workdir = state
                .workdir
                .as_ref()
                .context("simulated worker has no workdir")?;
            let path = WorkspaceLayout::new(workdir).report_path(phase);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let report = serde_json::json!({
                "run": run,
                "phase": phase,
                "attempt": attempt,
                "quality_score": score,
                "summary": format!("{phase} attempt {attempt}"),
            });
            fs::write(&path, serde_json::to_string_pretty(&report)?)?;
            state.output.push_str(&format!("wrote {}\n", path.display()));
        } else {
            state
                .output
                .push_str(&format!(
                    "FOREMAN-DONE run={run} phase={phase} attempt={attempt} score={score}\n"
                ));
        }
        Ok(())
    }
}

impl SessionHost for SimulatedWorker {
    fn check(&self) -> Result<String> {
        Ok("simulated".to_string())
    }

    fn has_session(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.state).live.iter().any(|live| live == name))
    }

    fn create(&self, name: &str, workdir: &Path, _command: &[String]) -> Result<()> {
        let mut state = lock(&self.state);
        state.live.push(name.to_string());
        state.workdir = Some(workdir.to_path_buf());
        state.output = "Worker v1.0\n".to_string();
        if self.trust_prompt {
            state.awaiting_trust = true;
            state.output.push_str(TRUST_PROMPT);
            state.output.push_str("\n 1. Yes, proceed\n 2. No, exit\n");
        } else {
            state.output.push_str(READY_PROMPT);
            state.output.push('\n');
        }
        Ok(())
    }

    fn capture(&self, name: &str, lines: usize) -> Result<String> {
        let state = lock(&self.state);
        if !state.live.iter().any(|live| live == name) {
            return Err(anyhow!("can't find session: {name}"));
        }
        Ok(tail_lines(&state.output, lines))
    }

    fn send(&self, name: &str, text: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.live.iter().any(|live| live == name) {
            return Err(anyhow!("can't find session: {name}"));
        }
        state.sent.push(text.to_string());
        if state.awaiting_trust {
            state.awaiting_trust = false;
            state.output.push_str(READY_PROMPT);
            state.output.push('\n');
            return Ok(());
        }
        state.output.push_str(&format!("> {text}\n"));
        let Some(caps) = self.directive.captures(text) else {
            return Ok(());
        };
        state.directives.push(text.to_string());
        let run = caps["run"].to_string();
        let phase = caps["phase"].to_string();
        let attempt: u32 = caps["attempt"].parse()?;
        if self.silent.contains(&phase) {
            return Ok(());
        }
        self.complete(&mut state, &run, &phase, attempt)
    }

    fn kill(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let before = state.live.len();
        state.live.retain(|live| live != name);
        if state.live.len() != before {
            state.killed.push(name.to_string());
        }
        Ok(())
    }
}

type SleepHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ClockState {
    elapsed: Duration,
    sleeps: usize,
    hooks: Vec<(usize, SleepHook)>,
}

/// Clock whose `sleep` advances time instantly.
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ClockState>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Total time slept so far.
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }

    /// Run `hook` during the `nth` call to `sleep` (1-based).
    pub fn on_sleep(&self, nth: usize, hook: impl FnOnce() + Send + 'static) {
        lock(&self.state).hooks.push((nth, Box::new(hook)));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + lock(&self.state).elapsed
    }

    fn sleep(&self, duration: Duration) {
        let due: Vec<SleepHook> = {
            let mut state = lock(&self.state);
            state.elapsed += duration;
            state.sleeps += 1;
            let current = state.sleeps;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.hooks.drain(..).partition(|(nth, _)| *nth == current);
            state.hooks = pending;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for hook in due {
            hook();
        }
    }
}

/// Observer that keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Vec<String>,
}

impl RunObserver for RecordingObserver {
    fn on_event(&mut self, message: &str) {
        self.events.push(message.to_string());
    }
}
