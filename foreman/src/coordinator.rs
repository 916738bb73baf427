//! Phase coordination loop for one dispatched task.
//!
//! Each poll gathers completion signals (report files and output lines),
//! feeds them to the pure scheduler, then carries out the resulting actions:
//! directives to the session, marker files, and a persisted task record.
//! Signal gathering is read-only, so phases running side by side never hide
//! output from each other. Only signals carrying the record's run token count,
//! so scrollback left by an earlier dispatch of the same session is inert.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::exhausted;
use crate::core::outcome::TaskOutcome;
use crate::core::scheduler::{PhaseAction, PlanOutcome, SchedulePolicy, TaskState, abort, advance};
use crate::core::signals::CompletionPattern;
use crate::dispatch::send_directive;
use crate::io::clock::Clock;
use crate::io::reports::{ReportReader, cancel_requested, take_continue, write_marker};
use crate::io::session::{Session, SessionManager};
use crate::io::task_store::{TaskRecord, TaskStore};
use crate::io::workspace::{MarkerKind, WorkspaceLayout};

/// Receives human-readable progress events.
pub trait RunObserver {
    fn on_event(&mut self, message: &str);
}

/// Observer that drops every event.
#[derive(Debug, Default)]
pub struct NullObserver;

impl RunObserver for NullObserver {
    fn on_event(&mut self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub poll_interval: Duration,
    pub run_timeout: Duration,
    pub capture_lines: usize,
}

/// Terminal result of coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEnd {
    pub outcome: TaskOutcome,
    pub reason: String,
}

pub struct Coordinator<'a> {
    pub manager: &'a SessionManager<'a>,
    pub clock: &'a dyn Clock,
    pub store: &'a TaskStore,
    pub reports: &'a ReportReader,
    pub pattern: &'a CompletionPattern,
    pub policy: SchedulePolicy,
    pub settings: CoordinatorSettings,
}

impl Coordinator<'_> {
    /// Drive `record.plan` to a terminal state.
    ///
    /// Bounded by `settings.run_timeout`. Cancellation, timeout and session
    /// loss reconcile running phases to `failed` and the rest to `blocked`.
    #[instrument(skip_all, fields(task_id = %record.id, mode = %self.policy.mode))]
    pub fn run(
        &self,
        record: &mut TaskRecord,
        session: &mut Session,
        layout: &WorkspaceLayout,
        observer: &mut dyn RunObserver,
    ) -> Result<RunEnd> {
        let run = record
            .run_token
            .clone()
            .context("task has no run token; it was never dispatched")?;
        let started = self.clock.now();
        let mut announced_pause = false;

        loop {
            if let Some(reason) = cancel_requested(layout)? {
                return self.abort_run(record, session, layout, TaskOutcome::Cancelled, &reason, observer);
            }
            if exhausted(started, self.settings.run_timeout, self.clock.now()) {
                let reason = format!(
                    "run exceeded {}s without finishing",
                    self.settings.run_timeout.as_secs()
                );
                return self.abort_run(record, session, layout, TaskOutcome::TimedOut, &reason, observer);
            }
            if !self.manager.is_alive(session)? {
                return self.abort_run(
                    record,
                    session,
                    layout,
                    TaskOutcome::Failed,
                    "session terminated",
                    observer,
                );
            }

            let output = self.manager.capture(session, self.settings.capture_lines)?;
            let mut reports = self.reports.collect_active(layout, &record.plan, &run);
            reports.extend(self.pattern.parse(&output, &run));

            let continue_requested = record.plan.awaiting_continue && take_continue(layout)?;
            if continue_requested {
                observer.on_event("continue received");
                announced_pause = false;
            }

            let step = advance(&mut record.plan, &self.policy, &reports, continue_requested);
            self.apply(&step.actions, record, session, layout, &run, observer)?;
            if !step.actions.is_empty() || continue_requested {
                record.session = Some(session.clone());
                self.store.save(record)?;
            }

            match step.state {
                TaskState::Finished(plan_outcome) => {
                    let end = run_end(plan_outcome);
                    info!(outcome = %end.outcome, reason = %end.reason, "plan finished");
                    return Ok(end);
                }
                TaskState::AwaitingContinue if !announced_pause => {
                    announced_pause = true;
                    observer.on_event(&format!(
                        "paused after phase completion; run `foreman continue {}` to proceed",
                        record.id
                    ));
                }
                _ => {}
            }
            self.clock.sleep(self.settings.poll_interval);
        }
    }

    fn apply(
        &self,
        actions: &[PhaseAction],
        record: &TaskRecord,
        session: &mut Session,
        layout: &WorkspaceLayout,
        run: &str,
        observer: &mut dyn RunObserver,
    ) -> Result<()> {
        for action in actions {
            match action {
                PhaseAction::Start { phase, attempt } => {
                    observer.on_event(&format!("phase {phase}: started (attempt {attempt})"));
                }
                PhaseAction::Refine {
                    phase,
                    attempt,
                    quality_score,
                } => {
                    observer.on_event(&format!(
                        "phase {phase}: scored {quality_score}, refining (attempt {attempt})"
                    ));
                }
                PhaseAction::Completed {
                    phase,
                    quality_score,
                } => {
                    write_marker(layout, phase, MarkerKind::Done, &format!("quality_score {quality_score}"))?;
                    observer.on_event(&format!("phase {phase}: complete (score {quality_score})"));
                }
                PhaseAction::Failed { phase, reason } => {
                    write_marker(layout, phase, MarkerKind::Failed, reason)?;
                    observer.on_event(&format!("phase {phase}: failed ({reason})"));
                }
                PhaseAction::Blocked { phase, reason } => {
                    write_marker(layout, phase, MarkerKind::Blocked, reason)?;
                    observer.on_event(&format!("phase {phase}: blocked ({reason})"));
                }
            }
            send_directive(
                self.manager,
                session,
                &record.plan,
                action,
                run,
                self.policy.gate.threshold,
            )
            .context("send phase directive")?;
        }
        Ok(())
    }

    fn abort_run(
        &self,
        record: &mut TaskRecord,
        session: &mut Session,
        layout: &WorkspaceLayout,
        outcome: TaskOutcome,
        reason: &str,
        observer: &mut dyn RunObserver,
    ) -> Result<RunEnd> {
        warn!(outcome = %outcome, reason, "aborting run");
        let actions = abort(&mut record.plan, reason);
        for action in &actions {
            let (phase, kind) = match action {
                PhaseAction::Failed { phase, .. } => (phase, MarkerKind::Failed),
                PhaseAction::Blocked { phase, .. } => (phase, MarkerKind::Blocked),
                _ => continue,
            };
            if let Err(err) = write_marker(layout, phase, kind, reason) {
                debug!(error = %format!("{err:#}"), "marker not written");
            }
        }
        observer.on_event(&format!("run {outcome}: {reason}"));
        record.session = Some(session.clone());
        self.store.save(record)?;
        Ok(RunEnd {
            outcome,
            reason: reason.to_string(),
        })
    }
}

fn run_end(outcome: PlanOutcome) -> RunEnd {
    match outcome {
        PlanOutcome::Completed => RunEnd {
            outcome: TaskOutcome::Completed,
            reason: "all phases complete".to_string(),
        },
        PlanOutcome::Failed { phases } => RunEnd {
            outcome: TaskOutcome::Failed,
            reason: format!("phase(s) failed: {}", phases.join(", ")),
        },
        PlanOutcome::Blocked { failed, blocked } => RunEnd {
            outcome: TaskOutcome::Blocked,
            reason: format!(
                "phase(s) {} failed; blocked: {}",
                failed.join(", "),
                blocked.join(", ")
            ),
        },
    }
}
