//! Operator commands that act on a persisted task: status, continue, cancel, reap.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::core::naming::sanitize_task_id;
use crate::core::outcome::TaskOutcome;
use crate::core::scheduler::abort;
use crate::io::git::Git;
use crate::io::reports::{request_cancel, request_continue};
use crate::io::session::SessionHost;
use crate::io::task_store::{TaskRecord, TaskStore};
use crate::io::workspace::{MarkerKind, WorkspaceLayout};
use crate::reaper::{ReapPolicy, reap};

fn open(repo: &Path, task_id: &str) -> Result<(TaskStore, TaskRecord)> {
    let root = Git::new(repo)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", repo.display()))?;
    let store = TaskStore::for_repo(&root);
    let record = store.require(&sanitize_task_id(task_id))?;
    Ok((store, record))
}

fn layout_of(record: &TaskRecord) -> Result<WorkspaceLayout> {
    let workspace = record
        .workspace
        .as_ref()
        .with_context(|| format!("task '{}' has no workspace yet", record.id))?;
    Ok(workspace.layout())
}

/// Human-readable snapshot of a task record and its marker files.
pub fn status(repo: &Path, task_id: &str) -> Result<String> {
    let (_, record) = open(repo, task_id)?;
    Ok(render_status(&record))
}

pub fn render_status(record: &TaskRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "task:        {}", record.id);
    let _ = writeln!(out, "description: {}", record.description);
    let _ = writeln!(out, "mode:        {}", record.mode);
    match (record.outcome, &record.reason) {
        (Some(outcome), Some(reason)) => {
            let _ = writeln!(out, "outcome:     {outcome} ({reason})");
        }
        (Some(outcome), None) => {
            let _ = writeln!(out, "outcome:     {outcome}");
        }
        (None, _) if record.plan.awaiting_continue => {
            let _ = writeln!(
                out,
                "outcome:     paused, run `foreman continue {}`",
                record.id
            );
        }
        (None, _) => {
            let _ = writeln!(out, "outcome:     in progress");
        }
    }
    let layout = record.workspace.as_ref().map(|ws| ws.layout());
    if let Some(ws) = &record.workspace {
        let _ = writeln!(out, "workspace:   {} ({})", ws.path.display(), ws.branch);
    }
    if let Some(session) = &record.session {
        let _ = writeln!(
            out,
            "session:     {} ({:?}); attach with `{}`",
            session.id,
            session.state,
            session.attach_hint()
        );
    }
    if let Some(reaped) = record.reaped_at {
        let _ = writeln!(out, "reaped at:   {}", reaped.to_rfc3339());
    }
    let _ = writeln!(out, "phases:");
    for phase in &record.plan.phases {
        let score = phase
            .quality_score
            .map_or_else(|| "-".to_string(), |score| score.to_string());
        let marker = layout
            .as_ref()
            .and_then(|layout| marker_on_disk(layout, &phase.name))
            .unwrap_or("-");
        let _ = write!(
            out,
            "  {:<12} {:<14} {:<13} score {:>3}  attempt {}/{}  marker {}",
            phase.name,
            phase.role,
            phase.status.as_str(),
            score,
            phase.attempt(),
            phase.max_iterations + 1,
            marker
        );
        if let Some(reason) = &phase.reason {
            let _ = write!(out, "  ({reason})");
        }
        out.push('\n');
    }
    out
}

fn marker_on_disk(layout: &WorkspaceLayout, phase: &str) -> Option<&'static str> {
    [MarkerKind::Done, MarkerKind::Failed, MarkerKind::Blocked]
        .into_iter()
        .find(|kind| layout.marker_path(phase, *kind).exists())
        .map(MarkerKind::extension)
}

/// Drop the continue signal for a conservative-mode task.
pub fn continue_task(repo: &Path, task_id: &str) -> Result<String> {
    let (_, record) = open(repo, task_id)?;
    if let Some(outcome) = record.outcome {
        bail!("task '{}' already finished: {outcome}", record.id);
    }
    request_continue(&layout_of(&record)?)?;
    info!(task_id = %record.id, "continue requested");
    Ok(if record.plan.awaiting_continue {
        format!("continue sent to task {}", record.id)
    } else {
        format!(
            "continue queued for task {}; it applies at the next checkpoint",
            record.id
        )
    })
}

/// Drop the cancel signal; the supervising `launch` aborts and reaps.
pub fn cancel_task(repo: &Path, task_id: &str, reason: Option<&str>) -> Result<String> {
    let (_, record) = open(repo, task_id)?;
    if let Some(outcome) = record.outcome {
        bail!("task '{}' already finished: {outcome}", record.id);
    }
    request_cancel(&layout_of(&record)?, reason.unwrap_or(""))?;
    info!(task_id = %record.id, "cancel requested");
    Ok(format!(
        "cancel requested for task {}; if no launch is supervising it, run `foreman reap {} --outcome cancelled`",
        record.id, record.id
    ))
}

/// Outcome of a manual reap, for printing.
#[derive(Debug, Clone)]
pub struct ManualReap {
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub lines: Vec<String>,
}

/// Invoke the reaper by hand. Safe to repeat.
pub fn reap_task(
    repo: &Path,
    task_id: &str,
    outcome: Option<TaskOutcome>,
    host: &dyn SessionHost,
) -> Result<ManualReap> {
    let (store, mut record) = open(repo, task_id)?;
    let outcome = outcome.or(record.outcome).unwrap_or(TaskOutcome::Cancelled);
    if record.outcome.is_none() {
        abort(&mut record.plan, "reaped by operator");
        record.reason = Some("reaped by operator".to_string());
    }
    let policy = ReapPolicy::manual(&record, outcome);
    let summary = reap(&mut record, outcome, policy, host)?;
    store.save(&mut record)?;

    let mut lines = Vec::new();
    lines.push(if summary.session_killed {
        "session terminated".to_string()
    } else {
        "no live session".to_string()
    });
    let workspace: Option<PathBuf> = record.workspace.as_ref().map(|ws| ws.path.clone());
    match (&workspace, summary.workspace_removed, &summary.kept) {
        (_, true, _) => lines.push("workspace removed".to_string()),
        (Some(path), false, Some(kept)) => {
            lines.push(format!("workspace kept at {} ({kept})", path.display()))
        }
        (Some(path), false, None) if path.exists() => {
            lines.push(format!("workspace kept at {}", path.display()))
        }
        _ => lines.push("no workspace on disk".to_string()),
    }
    if summary.branch_deleted {
        lines.push("branch deleted".to_string());
    }
    Ok(ManualReap {
        task_id: record.id,
        outcome,
        lines,
    })
}
