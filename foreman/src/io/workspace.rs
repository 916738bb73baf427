//! Isolated per-task workspaces backed by git worktrees.
//!
//! Provisioning is create-or-attach: a second call for the same task id returns
//! the worktree the first call created. The base repository is the only
//! resource shared between tasks, and "already exists" is treated as success.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::naming::branch_name;
use crate::error::ForemanError;
use crate::io::config::CleanupConfig;
use crate::io::git::{Git, WorktreeEntry};

/// Control directory inside every workspace (and the base repository).
pub const CONTROL_DIR: &str = ".foreman";

/// One task's worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub cleanup: CleanupConfig,
    /// True when provisioning found the worktree already in place.
    #[serde(default)]
    pub attached: bool,
}

impl Workspace {
    pub fn layout(&self) -> WorkspaceLayout {
        WorkspaceLayout::new(&self.path)
    }
}

/// Marker file kinds written for finished phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Done,
    Failed,
    Blocked,
}

impl MarkerKind {
    pub fn extension(self) -> &'static str {
        match self {
            MarkerKind::Done => "done",
            MarkerKind::Failed => "failed",
            MarkerKind::Blocked => "blocked",
        }
    }
}

/// Well-known paths under `<workspace>/.foreman/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    control: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            control: workspace_root.join(CONTROL_DIR),
        }
    }

    pub fn mission_path(&self) -> PathBuf {
        self.control.join("MISSION.md")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.control.join("reports")
    }

    pub fn report_path(&self, phase: &str) -> PathBuf {
        self.reports_dir().join(format!("{phase}.json"))
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.control.join("markers")
    }

    pub fn marker_path(&self, phase: &str, kind: MarkerKind) -> PathBuf {
        self.markers_dir()
            .join(format!("{phase}.{}", kind.extension()))
    }

    pub fn continue_path(&self) -> PathBuf {
        self.control.join("CONTINUE")
    }

    pub fn cancel_path(&self) -> PathBuf {
        self.control.join("CANCEL")
    }

    /// Create the control directory tree. Its `.gitignore` keeps every control
    /// file out of `git status`.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.control.clone(), self.reports_dir(), self.markers_dir()] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let ignore = self.control.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "*\n").with_context(|| format!("write {}", ignore.display()))?;
        }
        Ok(())
    }
}

/// Create or attach the worktree for `task_id`.
///
/// `base_repo` must be inside a git repository; the worktree lands at
/// `<workspaces_dir>/<task_id>` on branch `foreman/<task_id>`.
#[instrument(skip_all, fields(task_id, base_repo = %base_repo.display()))]
pub fn provision(
    task_id: &str,
    base_repo: &Path,
    workspaces_dir: &Path,
    cleanup: CleanupConfig,
) -> Result<Workspace> {
    let git = Git::new(base_repo);
    git.toplevel().map_err(|err| {
        ForemanError::provisioning(base_repo, format!("not a git repository: {err:#}"))
    })?;

    fs::create_dir_all(workspaces_dir)
        .map_err(|err| ForemanError::provisioning(workspaces_dir, err))?;
    let workspaces_dir = fs::canonicalize(workspaces_dir)
        .map_err(|err| ForemanError::provisioning(workspaces_dir, err))?;
    let path = workspaces_dir.join(task_id);
    let branch = branch_name(task_id);

    let attached = create_or_attach(&git, &path, &branch)
        .map_err(|err| ForemanError::provisioning(&path, err))?;
    WorkspaceLayout::new(&path)
        .ensure()
        .map_err(|err| ForemanError::provisioning(&path, err))?;

    if attached {
        info!(path = %path.display(), branch, "attached to existing workspace");
    } else {
        info!(path = %path.display(), branch, "workspace created");
    }
    Ok(Workspace {
        path,
        branch,
        created_at: Utc::now(),
        cleanup,
        attached,
    })
}

/// Returns `true` when an existing worktree was reused.
fn create_or_attach(git: &Git, path: &Path, branch: &str) -> Result<bool> {
    if let Some(entry) = find_worktree(&git.worktrees()?, path) {
        if entry.prunable || !path.exists() {
            warn!(path = %path.display(), "stale worktree registration, pruning");
            git.prune_worktrees()?;
        } else if entry.branch.as_deref() == Some(branch) {
            return Ok(true);
        } else {
            return Err(anyhow!(
                "path is a worktree of branch {:?}, expected {branch}",
                entry.branch
            ));
        }
    }

    let created = if git.branch_exists(branch)? {
        debug!(branch, "reusing existing branch");
        git.add_worktree_existing_branch(path, branch)
    } else {
        git.add_worktree_new_branch(path, branch, "HEAD")
    };
    match created {
        Ok(()) => Ok(false),
        Err(err) => {
            // A concurrent launch may have created the same worktree.
            let registered = git.worktrees()?;
            match find_worktree(&registered, path) {
                Some(entry) if entry.branch.as_deref() == Some(branch) && path.exists() => {
                    debug!("worktree appeared concurrently, attaching");
                    Ok(true)
                }
                _ => Err(err),
            }
        }
    }
}

fn find_worktree<'a>(entries: &'a [WorktreeEntry], path: &Path) -> Option<&'a WorktreeEntry> {
    entries.iter().find(|entry| entry.path == path)
}
