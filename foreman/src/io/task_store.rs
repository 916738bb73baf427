//! Persisted task records (`<repo>/.foreman/tasks/<task_id>.json`).
//!
//! The record is rewritten atomically after every state change so `status`,
//! `continue`, `cancel` and a resumed `launch` all see a consistent snapshot.
//! A supervising `launch` also holds `<task_id>.lock` so a second one refuses
//! to drive the same task.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::outcome::TaskOutcome;
use crate::core::plan::PhasePlan;
use crate::core::types::Mode;
use crate::io::config::write_atomic;
use crate::io::session::Session;
use crate::io::workspace::{CONTROL_DIR, Workspace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub mode: Mode,
    pub base_repo: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workspace: Option<Workspace>,
    pub session: Option<Session>,
    pub plan: PhasePlan,
    /// Mission written and first directive sent.
    #[serde(default)]
    pub dispatched: bool,
    /// Token of the current dispatch; completion signals must carry it.
    #[serde(default)]
    pub run_token: Option<String>,
    #[serde(default)]
    pub outcome: Option<TaskOutcome>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reaped_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: &str, description: &str, mode: Mode, base_repo: &Path, plan: PhasePlan) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            description: description.to_string(),
            mode,
            base_repo: base_repo.to_path_buf(),
            created_at: now,
            updated_at: now,
            workspace: None,
            session: None,
            plan,
            dispatched: false,
            run_token: None,
            outcome: None,
            reason: None,
            reaped_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Directory of task records for one base repository.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn for_repo(repo_root: &Path) -> Self {
        Self {
            dir: repo_root.join(CONTROL_DIR).join("tasks"),
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub fn load(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let path = self.path_for(task_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read task record {}", path.display())),
        };
        let record: TaskRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse task record {}", path.display()))?;
        debug!(task_id, outcome = ?record.outcome, "task record loaded");
        Ok(Some(record))
    }

    /// Load a record that must exist.
    pub fn require(&self, task_id: &str) -> Result<TaskRecord> {
        self.load(task_id)?
            .with_context(|| format!("no task record for '{task_id}' at {}", self.path_for(task_id).display()))
    }

    /// Stamp `updated_at` and write atomically.
    pub fn save(&self, record: &mut TaskRecord) -> Result<()> {
        record.updated_at = Utc::now();
        self.ensure_ignored()?;
        let mut buf = serde_json::to_string_pretty(record).context("serialize task record")?;
        buf.push('\n');
        write_atomic(&self.path_for(&record.id), &buf)
    }

    pub fn lock_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.lock"))
    }

    /// Claim `task_id` for this process until the returned guard drops.
    ///
    /// A lock whose recorded process no longer runs is replaced.
    pub fn lock(&self, task_id: &str) -> Result<TaskLock> {
        self.ensure_ignored()?;
        let path = self.lock_path(task_id);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("write {}", path.display()))?;
                    debug!(task_id, lock = %path.display(), "task lock acquired");
                    return Ok(TaskLock { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|contents| contents.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if !process_alive(pid) => {
                            warn!(task_id, pid, lock = %path.display(), "replacing stale task lock");
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(err) if err.kind() == ErrorKind::NotFound => {}
                                Err(err) => {
                                    return Err(err)
                                        .with_context(|| format!("remove {}", path.display()));
                                }
                            }
                        }
                        Some(pid) => {
                            return Err(anyhow!(
                                "task '{task_id}' is already being supervised by process {pid} (lock {})",
                                path.display()
                            ));
                        }
                        None => {
                            return Err(anyhow!(
                                "task '{task_id}' is already being supervised (lock {}; remove it if no launch is running)",
                                path.display()
                            ));
                        }
                    }
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create {}", path.display()));
                }
            }
        }
        Err(anyhow!("could not claim task lock {}", path.display()))
    }

    fn ensure_ignored(&self) -> Result<()> {
        let ignore = self.dir.join(".gitignore");
        if ignore.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))
    }
}

/// Exclusive claim on supervising one task. Removes its lock file on drop.
#[derive(Debug)]
pub struct TaskLock {
    path: PathBuf,
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(lock = %self.path.display(), error = %err, "failed to release task lock");
        }
    }
}

/// Whether `pid` names a running process. Unknown means alive.
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    if proc_root.join("self").exists() {
        return proc_root.join(pid.to_string()).exists();
    }
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_or(true, |status| status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::default_phase_specs;
    use crate::core::types::PhaseStatus;

    fn record(base: &Path) -> TaskRecord {
        let plan = PhasePlan::from_specs(&default_phase_specs(), 2).expect("plan");
        TaskRecord::new("fix-it-0011aabb", "fix it", Mode::Sequential, base, plan)
    }

    #[test]
    fn missing_record_loads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_repo(temp.path());
        assert!(store.load("nope").expect("load").is_none());
        let err = store.require("nope").unwrap_err();
        assert!(err.to_string().contains("no task record for 'nope'"));
    }

    #[test]
    fn save_then_load_round_trips_and_ignores_itself() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_repo(temp.path());
        let mut rec = record(temp.path());
        rec.plan.phases[0].status = PhaseStatus::Complete;
        rec.plan.phases[0].quality_score = Some(97);
        rec.outcome = Some(TaskOutcome::Blocked);
        rec.reason = Some("upstream failed".to_string());

        store.save(&mut rec).expect("save");
        let loaded = store.require(&rec.id).expect("load");
        assert_eq!(loaded, rec);
        assert_eq!(
            fs::read_to_string(temp.path().join(".foreman/tasks/.gitignore")).expect("ignore"),
            "*\n"
        );
        let json = fs::read_to_string(store.path_for(&rec.id)).expect("json");
        assert!(json.contains("\"outcome\": \"blocked\""));
        assert!(json.contains("\"status\": \"complete\""));
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_repo(temp.path());
        let held = store.lock("t-1").expect("lock");
        assert_eq!(
            fs::read_to_string(store.lock_path("t-1")).expect("pid").trim(),
            std::process::id().to_string()
        );

        let err = store.lock("t-1").unwrap_err();
        assert!(err.to_string().contains("already being supervised"));
        assert!(store.lock("t-2").is_ok());

        drop(held);
        assert!(!store.lock_path("t-1").exists());
        assert!(store.lock("t-1").is_ok());
    }

    #[test]
    fn lock_left_by_an_exited_process_is_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::for_repo(temp.path());
        fs::create_dir_all(temp.path().join(".foreman/tasks")).expect("mkdir");
        // Above the largest pid Linux hands out.
        fs::write(store.lock_path("t-1"), "4194305\n").expect("stale lock");

        let _lock = store.lock("t-1").expect("lock");
        assert_eq!(
            fs::read_to_string(store.lock_path("t-1")).expect("pid").trim(),
            std::process::id().to_string()
        );
    }
}
