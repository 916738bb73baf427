//! Git adapter for workspace provisioning and teardown.
//!
//! Workspaces are git worktrees on per-task branches. We keep a small, explicit
//! wrapper around `git` subprocess calls so every operation is logged and
//! failures carry git's stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name (`refs/heads/` stripped); `None` when detached.
    pub branch: Option<String>,
    /// Registered but the directory is gone.
    pub prunable: bool,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Absolute path of the repository top level; errors outside a repository.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Registered worktrees, main worktree first.
    pub fn worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Create `branch` at `start_point` and check it out into a new worktree at `path`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn add_worktree_new_branch(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        debug!("adding worktree on new branch");
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", "-b", branch, &path, start_point])?;
        Ok(())
    }

    /// Check out an existing `branch` into a new worktree at `path`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn add_worktree_existing_branch(&self, path: &Path, branch: &str) -> Result<()> {
        debug!("adding worktree on existing branch");
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", &path, branch])?;
        Ok(())
    }

    /// Remove the worktree at `path`. `force` discards uncommitted changes.
    #[instrument(skip_all, fields(path = %path.display(), force))]
    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<()> {
        let path = path_arg(path)?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Drop registrations whose directories no longer exist.
    pub fn prune_worktrees(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Delete a local branch (`-D`: the branch need not be merged).
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// True if the worktree has no staged, unstaged, or untracked changes.
    pub fn is_clean(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out.trim().is_empty())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(raw: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in raw.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
                prunable: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(branch) = line.strip_prefix("branch ") {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(short.to_string());
            } else if line == "prunable" || line.starts_with("prunable ") {
                entry.prunable = true;
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "worktree /repo\nHEAD 1111111111111111111111111111111111111111\nbranch refs/heads/main\n\nworktree /wt/fix-login-1a2b3c4d\nHEAD 2222222222222222222222222222222222222222\nbranch refs/heads/foreman/fix-login-1a2b3c4d\n\nworktree /wt/gone\nHEAD 3333333333333333333333333333333333333333\ndetached\nprunable gitdir file points to non-existent location\n\n";

    #[test]
    fn parses_worktree_entries() {
        let entries = parse_worktree_list(LIST);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(
            entries[1],
            WorktreeEntry {
                path: PathBuf::from("/wt/fix-login-1a2b3c4d"),
                branch: Some("foreman/fix-login-1a2b3c4d".to_string()),
                prunable: false,
            }
        );
        assert_eq!(entries[2].branch, None);
        assert!(entries[2].prunable);
    }

    #[test]
    fn parses_empty_output() {
        assert!(parse_worktree_list("").is_empty());
    }
}
