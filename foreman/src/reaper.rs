//! Idempotent teardown of a task's session and workspace.
//!
//! Every resource is looked up by the names derived from the task id and
//! checked against the record before anything is removed, so a reap can never
//! touch another task's session, worktree or branch. Running it twice is safe:
//! the second pass finds nothing left to do.

use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::naming::{branch_name, session_name};
use crate::core::outcome::TaskOutcome;
use crate::io::git::Git;
use crate::io::session::SessionHost;
use crate::io::task_store::TaskRecord;

/// What a reap is allowed to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub kill_session: bool,
    pub remove_workspace: bool,
    pub delete_branch: bool,
}

impl ReapPolicy {
    /// Policy applied automatically when a run ends with `outcome`.
    ///
    /// Non-completed runs keep their workspace. Their session is kept too
    /// (so the operator can attach) unless the run was cancelled or
    /// `kill_session_on_failure` is set.
    pub fn for_outcome(record: &TaskRecord, outcome: TaskOutcome, keep_workspace: bool) -> Self {
        let cleanup = record.workspace.as_ref().map(|ws| ws.cleanup).unwrap_or_default();
        let success = outcome.is_success();
        Self {
            kill_session: success
                || outcome == TaskOutcome::Cancelled
                || cleanup.kill_session_on_failure,
            remove_workspace: success && !keep_workspace && cleanup.remove_workspace_on_success,
            delete_branch: success && !keep_workspace && cleanup.delete_branch_on_success,
        }
    }

    /// Policy for an explicit operator reap: the session always goes.
    pub fn manual(record: &TaskRecord, outcome: TaskOutcome) -> Self {
        Self {
            kill_session: true,
            ..Self::for_outcome(record, outcome, false)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub session_killed: bool,
    pub workspace_removed: bool,
    pub branch_deleted: bool,
    /// Why the workspace was kept, when it was eligible for removal.
    pub kept: Option<String>,
}

/// Release the task's resources according to `policy` and stamp the record.
#[instrument(skip_all, fields(task_id = %record.id, outcome = %outcome))]
pub fn reap(
    record: &mut TaskRecord,
    outcome: TaskOutcome,
    policy: ReapPolicy,
    host: &dyn SessionHost,
) -> Result<ReapSummary> {
    let mut summary = ReapSummary::default();
    let expected_session = session_name(&record.id);
    let expected_branch = branch_name(&record.id);

    if let Some(session) = &record.session
        && session.id != expected_session
    {
        return Err(anyhow!(
            "record session '{}' does not belong to task '{}'",
            session.id,
            record.id
        ));
    }

    if policy.kill_session && host.has_session(&expected_session)? {
        host.kill(&expected_session)?;
        summary.session_killed = true;
        info!(session = %expected_session, "session terminated");
    }
    if policy.kill_session
        && let Some(session) = record.session.as_mut()
    {
        session.state = crate::core::types::SessionState::Terminated;
    }

    if let Some(workspace) = record.workspace.clone() {
        if workspace.branch != expected_branch {
            return Err(anyhow!(
                "record workspace branch '{}' does not belong to task '{}'",
                workspace.branch,
                record.id
            ));
        }
        let git = Git::new(&record.base_repo);
        if policy.remove_workspace && workspace.path.exists() {
            match remove_owned_worktree(&git, &workspace.path, &expected_branch)? {
                None => {
                    summary.workspace_removed = true;
                    info!(path = %workspace.path.display(), "workspace removed");
                }
                Some(reason) => {
                    warn!(path = %workspace.path.display(), reason = %reason, "workspace kept");
                    summary.kept = Some(reason);
                }
            }
        }
        if policy.delete_branch
            && summary.kept.is_none()
            && !workspace.path.exists()
            && git.branch_exists(&expected_branch)?
        {
            git.delete_branch(&expected_branch)?;
            summary.branch_deleted = true;
            info!(branch = %expected_branch, "branch deleted");
        }
    }

    if record.outcome.is_none() {
        record.outcome = Some(outcome);
    }
    if record.reaped_at.is_none() {
        record.reaped_at = Some(Utc::now());
    }
    Ok(summary)
}

/// Remove `path` if it is a clean worktree of `branch`. Returns the reason it
/// was kept otherwise.
fn remove_owned_worktree(git: &Git, path: &Path, branch: &str) -> Result<Option<String>> {
    let registered = git.worktrees()?;
    let Some(entry) = registered.iter().find(|entry| entry.path == path) else {
        return Ok(Some("not a registered worktree".to_string()));
    };
    if entry.branch.as_deref() != Some(branch) {
        return Ok(Some(format!(
            "worktree is on branch {:?}, expected {branch}",
            entry.branch
        )));
    }
    if !Git::new(path).is_clean()? {
        return Ok(Some("worktree has uncommitted changes".to_string()));
    }
    git.remove_worktree(path, false)?;
    Ok(None)
}
