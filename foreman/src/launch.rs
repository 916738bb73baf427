//! `foreman launch`: provision, start, await readiness, dispatch, coordinate, reap.
//!
//! Every run ends in a [`RunReport`] with one of the five task outcomes. Fatal
//! adapter errors (provisioning, session host, dispatch) become a `failed`
//! outcome with the error as the reason; only invalid input, configuration or
//! a task already supervised by another launch is returned as `Err`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::automator::{ReadyOutcome, ReadySettings, await_ready};
use crate::coordinator::{Coordinator, CoordinatorSettings, RunEnd, RunObserver};
use crate::core::naming::{derive_task_id, run_token, sanitize_task_id, session_name};
use crate::core::outcome::TaskOutcome;
use crate::core::plan::PhasePlan;
use crate::core::rules::RuleTable;
use crate::core::scheduler::{PhaseAction, SchedulePolicy, abort, advance};
use crate::core::signals::CompletionPattern;
use crate::core::types::{Mode, SessionState};
use crate::dispatch::dispatch;
use crate::error::ForemanError;
use crate::io::clock::Clock;
use crate::io::config::ForemanConfig;
use crate::io::git::Git;
use crate::io::mission::MissionSpec;
use crate::io::reports::ReportReader;
use crate::io::session::{SessionHost, SessionManager};
use crate::io::task_store::{TaskRecord, TaskStore};
use crate::io::workspace::provision;
use crate::reaper::{ReapPolicy, reap};

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub description: String,
    pub mode: Mode,
    /// Explicit task id; derived from description and mode when `None`.
    pub task_id: Option<String>,
    pub repo: PathBuf,
    pub keep_workspace: bool,
}

/// External collaborators for a run.
pub struct Runtime<'a> {
    pub host: &'a dyn SessionHost,
    pub clock: &'a dyn Clock,
}

/// Final, operator-facing result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: TaskOutcome,
    pub reason: String,
    pub task_id: String,
    pub workspace: Option<PathBuf>,
    pub session: Option<String>,
    /// Manual recovery instructions for runs that did not complete.
    pub attach_hint: Option<String>,
}

impl RunReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "task {}: {}", self.task_id, self.outcome);
        let _ = writeln!(out, "reason: {}", self.reason);
        if let Some(path) = &self.workspace {
            let _ = writeln!(out, "workspace: {}", path.display());
        }
        if let Some(hint) = &self.attach_hint {
            let _ = writeln!(out, "to recover manually: {hint}");
        }
        out
    }
}

/// Run one task end to end.
#[instrument(skip_all, fields(mode = %request.mode))]
pub fn launch(
    request: &LaunchRequest,
    config: &ForemanConfig,
    runtime: &Runtime<'_>,
    observer: &mut dyn RunObserver,
) -> Result<RunReport> {
    let description = request.description.trim();
    if description.is_empty() {
        bail!("task description must not be empty");
    }
    config.validate()?;
    let task_id = match &request.task_id {
        Some(raw) => sanitize_task_id(raw),
        None => derive_task_id(description, request.mode),
    };

    let repo_root = match Git::new(&request.repo).toplevel() {
        Ok(root) => root,
        Err(err) => {
            let err = ForemanError::provisioning(&request.repo, format!("not a git repository: {err:#}"));
            error!(error = %err, "launch failed");
            return Ok(RunReport {
                outcome: TaskOutcome::Failed,
                reason: err.to_string(),
                task_id,
                workspace: None,
                session: None,
                attach_hint: None,
            });
        }
    };

    let store = TaskStore::for_repo(&repo_root);
    // Held until the run is reaped and recorded.
    let _lock = store.lock(&task_id)?;
    let fresh_plan = PhasePlan::from_specs(&config.phases, config.quality.max_iterations)
        .map_err(|errors| anyhow!("invalid phases: {}", errors.join("; ")))?;
    let mut record = match store.load(&task_id)? {
        Some(existing) if !existing.is_finished() => {
            if existing.description.trim() != description || existing.mode != request.mode {
                bail!(
                    "task id '{task_id}' is already used by an unfinished task ({} mode: {})",
                    existing.mode,
                    existing.description
                );
            }
            existing
        }
        _ => TaskRecord::new(&task_id, description, request.mode, &repo_root, fresh_plan.clone()),
    };
    info!(task_id = %record.id, "launching task");
    observer.on_event(&format!("task {} ({})", record.id, record.mode));

    let end = match drive(&mut record, &repo_root, &fresh_plan, config, runtime, &store, observer) {
        Ok(end) => end,
        Err(err) => {
            let reason = match err.downcast_ref::<ForemanError>() {
                Some(typed) => typed.to_string(),
                None => format!("{err:#}"),
            };
            error!(reason = %reason, "run aborted by error");
            RunEnd {
                outcome: TaskOutcome::Failed,
                reason,
            }
        }
    };
    finish(record, end, request.keep_workspace, runtime.host, &store)
}

fn drive(
    record: &mut TaskRecord,
    repo_root: &Path,
    fresh_plan: &PhasePlan,
    config: &ForemanConfig,
    runtime: &Runtime<'_>,
    store: &TaskStore,
    observer: &mut dyn RunObserver,
) -> Result<RunEnd> {
    let rules = RuleTable::compile(&config.rules)?;
    let pattern = CompletionPattern::new(&config.completion_pattern)?;
    let reports = ReportReader::new()?;
    let policy = SchedulePolicy {
        mode: record.mode,
        gate: config.quality,
        max_concurrent: config.max_concurrent_phases,
    };

    let workspaces_dir = config
        .resolve_workspaces_dir(repo_root)
        .map_err(|err| ForemanError::provisioning(repo_root, err))?;
    let mut workspace = provision(&record.id, repo_root, &workspaces_dir, config.cleanup)?;
    if let Some(previous) = &record.workspace
        && previous.path == workspace.path
    {
        workspace.created_at = previous.created_at;
    }
    observer.on_event(&format!(
        "workspace {} ({}) at {}",
        if workspace.attached { "attached" } else { "created" },
        workspace.branch,
        workspace.path.display()
    ));
    record.workspace = Some(workspace.clone());
    store.save(record)?;

    let manager = SessionManager::new(runtime.host);
    let name = session_name(&record.id);
    let resume = record.dispatched
        && record.run_token.is_some()
        && runtime
            .host
            .has_session(&name)
            .map_err(ForemanError::session_unavailable)?;
    let mut session = manager.start(&name, &workspace.path, &config.worker_command)?;
    if session.attached
        && let Some(previous) = &record.session
    {
        session.created_at = previous.created_at;
    }
    observer.on_event(&format!(
        "session {} {}",
        session.id,
        if session.attached { "attached" } else { "started" }
    ));
    record.session = Some(session.clone());
    store.save(record)?;

    if resume {
        manager.set_state(&mut session, SessionState::Busy);
        observer.on_event("resuming dispatched task from its saved phase states");
        info!(run = ?record.run_token, "resuming without re-dispatch");
    } else {
        record.plan = fresh_plan.clone();
        record.dispatched = false;
        let run = run_token(
            &record.id,
            &Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        record.run_token = Some(run.clone());

        let settings = ReadySettings {
            poll_interval: config.poll_interval(),
            timeout: config.startup_timeout(),
            capture_lines: config.capture_lines,
        };
        let ready = await_ready(&manager, &mut session, &rules, &settings, runtime.clock)?;
        record.session = Some(session.clone());
        match ready.outcome {
            ReadyOutcome::Ready => observer.on_event(&format!(
                "worker ready after {} poll(s), {} prompt(s) answered",
                ready.polls, ready.responses
            )),
            ReadyOutcome::TimedOut => {
                return Ok(RunEnd {
                    outcome: TaskOutcome::TimedOut,
                    reason: format!(
                        "worker did not become ready within {}s",
                        config.startup_timeout_secs
                    ),
                });
            }
            ReadyOutcome::Errored { rule, line } => {
                return Ok(RunEnd {
                    outcome: TaskOutcome::Failed,
                    reason: format!("worker reported an error ({rule}): {line}"),
                });
            }
        }

        let first = advance(&mut record.plan, &policy, &[], false);
        let spec = MissionSpec {
            task_id: &record.id,
            description: &record.description,
            mode: record.mode,
            branch: &workspace.branch,
            run: &run,
            plan: &record.plan,
            gate: config.quality,
        };
        dispatch(&manager, &mut session, &workspace, &spec, &first.actions)?;
        for action in &first.actions {
            if let PhaseAction::Start { phase, attempt } = action {
                observer.on_event(&format!("phase {phase}: started (attempt {attempt})"));
            }
        }
        record.dispatched = true;
        record.session = Some(session.clone());
        store.save(record)?;
    }

    let coordinator = Coordinator {
        manager: &manager,
        clock: runtime.clock,
        store,
        reports: &reports,
        pattern: &pattern,
        policy,
        settings: CoordinatorSettings {
            poll_interval: config.poll_interval(),
            run_timeout: config.run_timeout(),
            capture_lines: config.capture_lines,
        },
    };
    coordinator.run(record, &mut session, &workspace.layout(), observer)
}

/// Persist the outcome, reap, and build the report.
fn finish(
    mut record: TaskRecord,
    end: RunEnd,
    keep_workspace: bool,
    host: &dyn SessionHost,
    store: &TaskStore,
) -> Result<RunReport> {
    if !record.plan.all_terminal() {
        abort(&mut record.plan, &end.reason);
    }
    record.outcome = Some(end.outcome);
    record.reason = Some(end.reason.clone());
    store.save(&mut record)?;

    let mut reason = end.reason;
    let policy = ReapPolicy::for_outcome(&record, end.outcome, keep_workspace);
    match reap(&mut record, end.outcome, policy, host) {
        Ok(summary) => {
            if let Some(kept) = summary.kept {
                let _ = write!(reason, " (workspace kept: {kept})");
            }
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "cleanup failed");
            let _ = write!(reason, " (cleanup failed: {err:#})");
        }
    }
    store.save(&mut record)?;

    let session_alive = record
        .session
        .as_ref()
        .is_some_and(|session| session.state != SessionState::Terminated);
    let workspace = record
        .workspace
        .as_ref()
        .map(|ws| ws.path.clone())
        .filter(|path| path.exists());
    let attach_hint = if end.outcome.is_success() {
        None
    } else {
        let mut steps = Vec::new();
        if session_alive && let Some(session) = &record.session {
            steps.push(session.attach_hint());
        }
        if let Some(path) = &workspace {
            steps.push(format!("cd {}", path.display()));
        }
        steps.push(format!("foreman reap {} when done", record.id));
        Some(steps.join("; "))
    };

    info!(task_id = %record.id, outcome = %end.outcome, "run finished");
    Ok(RunReport {
        outcome: end.outcome,
        reason,
        task_id: record.id,
        workspace,
        session: record.session.map(|session| session.id),
        attach_hint,
    })
}
