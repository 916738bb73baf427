//! Phase scheduling state machine.
//!
//! [`advance`] is the single coordination point for a task: it folds completion
//! reports into the plan, applies the quality gate, propagates failures, and
//! decides which phases start next. It is pure and is called once per poll by
//! the coordinator, so phase transitions for one task are always serialized.

use crate::core::gate::{GateDecision, QualityGate};
use crate::core::plan::PhasePlan;
use crate::core::types::{Mode, PhaseStatus};

/// Scheduling inputs that do not change during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub mode: Mode,
    pub gate: QualityGate,
    /// Upper bound on simultaneously active phases in fan-out modes.
    pub max_concurrent: usize,
}

/// A completion signal for one phase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub phase: String,
    pub attempt: u32,
    pub quality_score: u8,
    pub summary: Option<String>,
}

/// Side effects the coordinator must carry out after an advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseAction {
    /// Instruct the worker to begin the first attempt of a phase.
    Start { phase: String, attempt: u32 },
    /// Instruct the worker to refine a phase that fell below the gate.
    Refine {
        phase: String,
        attempt: u32,
        quality_score: u8,
    },
    Completed { phase: String, quality_score: u8 },
    Failed { phase: String, reason: String },
    Blocked { phase: String, reason: String },
}

/// Final result of the phase plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Completed,
    /// At least one failed phase had nothing downstream of it.
    Failed { phases: Vec<String> },
    /// Every failure stranded downstream phases, which are now blocked.
    Blocked {
        failed: Vec<String>,
        blocked: Vec<String>,
    },
}

/// Task-level state after an advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    InProgress,
    /// Conservative mode checkpoint.
    AwaitingContinue,
    Finished(PlanOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub actions: Vec<PhaseAction>,
    pub state: TaskState,
}

/// Run one scheduling step.
///
/// 1. Consume a pending continue signal (conservative mode).
/// 2. Apply reports whose attempt matches an active phase; gate each score.
/// 3. Block every phase downstream of a failure.
/// 4. Promote pending phases whose dependencies are all complete to `ready`.
/// 5. Start ready phases as the mode allows, unless paused.
/// 6. Derive the task state.
pub fn advance(
    plan: &mut PhasePlan,
    policy: &SchedulePolicy,
    reports: &[CompletionReport],
    continue_requested: bool,
) -> Advance {
    let mut actions = Vec::new();

    if plan.awaiting_continue && continue_requested {
        plan.awaiting_continue = false;
    }

    for report in reports {
        apply_report(plan, policy, report, &mut actions);
    }

    propagate_failures(plan, &mut actions);
    promote_ready(plan);
    if !plan.awaiting_continue {
        start_ready(plan, policy, &mut actions);
    }

    let state = derive_state(plan);
    if matches!(state, TaskState::Finished(_)) {
        plan.awaiting_continue = false;
    }
    Advance { actions, state }
}

/// Force every unfinished phase into a terminal state.
///
/// Active phases become `failed` with `reason`; phases that never started become
/// `blocked`. Used on cancellation, run timeout, and session loss.
pub fn abort(plan: &mut PhasePlan, reason: &str) -> Vec<PhaseAction> {
    let mut actions = Vec::new();
    for phase in &mut plan.phases {
        if phase.status.is_active() {
            phase.status = PhaseStatus::Failed;
            phase.reason = Some(reason.to_string());
            actions.push(PhaseAction::Failed {
                phase: phase.name.clone(),
                reason: reason.to_string(),
            });
        } else if matches!(phase.status, PhaseStatus::Pending | PhaseStatus::Ready) {
            phase.status = PhaseStatus::Blocked;
            phase.reason = Some(reason.to_string());
            actions.push(PhaseAction::Blocked {
                phase: phase.name.clone(),
                reason: reason.to_string(),
            });
        }
    }
    plan.awaiting_continue = false;
    actions
}

fn apply_report(
    plan: &mut PhasePlan,
    policy: &SchedulePolicy,
    report: &CompletionReport,
    actions: &mut Vec<PhaseAction>,
) {
    let Some(phase) = plan.get_mut(&report.phase) else {
        return;
    };
    let accepting = matches!(phase.status, PhaseStatus::Running | PhaseStatus::Iterating);
    if !accepting || report.attempt != phase.attempt() {
        return;
    }

    phase.status = PhaseStatus::AwaitingGate;
    phase.quality_score = Some(report.quality_score);

    let decision =
        policy
            .gate
            .evaluate(report.quality_score, phase.iteration_count, phase.max_iterations);
    match decision {
        GateDecision::Pass => {
            phase.status = PhaseStatus::Complete;
            actions.push(PhaseAction::Completed {
                phase: phase.name.clone(),
                quality_score: report.quality_score,
            });
            if policy.mode.pauses_between_phases() {
                plan.awaiting_continue = true;
            }
        }
        GateDecision::Iterate => {
            phase.iteration_count += 1;
            phase.status = PhaseStatus::Iterating;
            actions.push(PhaseAction::Refine {
                phase: phase.name.clone(),
                attempt: phase.attempt(),
                quality_score: report.quality_score,
            });
        }
        GateDecision::Exhausted => {
            let reason = format!(
                "quality score {} below threshold {} after {} refinement(s)",
                report.quality_score, policy.gate.threshold, phase.iteration_count
            );
            phase.status = PhaseStatus::Failed;
            phase.reason = Some(reason.clone());
            actions.push(PhaseAction::Failed {
                phase: phase.name.clone(),
                reason,
            });
        }
    }
}

fn propagate_failures(plan: &mut PhasePlan, actions: &mut Vec<PhaseAction>) {
    for failed in plan.names_with_status(PhaseStatus::Failed) {
        for dependent in plan.transitive_dependents(&failed) {
            let Some(phase) = plan.get_mut(&dependent) else {
                continue;
            };
            if !matches!(phase.status, PhaseStatus::Pending | PhaseStatus::Ready) {
                continue;
            }
            let reason = format!("upstream phase '{failed}' failed");
            phase.status = PhaseStatus::Blocked;
            phase.reason = Some(reason.clone());
            actions.push(PhaseAction::Blocked {
                phase: dependent,
                reason,
            });
        }
    }
}

fn promote_ready(plan: &mut PhasePlan) {
    let promotable: Vec<String> = plan
        .phases
        .iter()
        .filter(|phase| phase.status == PhaseStatus::Pending)
        .filter(|phase| {
            phase
                .depends_on
                .iter()
                .all(|dep| plan.status_of(dep) == Some(PhaseStatus::Complete))
        })
        .map(|phase| phase.name.clone())
        .collect();
    for name in promotable {
        if let Some(phase) = plan.get_mut(&name) {
            phase.status = PhaseStatus::Ready;
        }
    }
}

fn start_ready(plan: &mut PhasePlan, policy: &SchedulePolicy, actions: &mut Vec<PhaseAction>) {
    let active = plan.active().count();
    let capacity = if policy.mode.allows_fan_out() {
        policy.max_concurrent.max(1).saturating_sub(active)
    } else if active == 0 {
        1
    } else {
        0
    };

    let to_start: Vec<String> = plan
        .names_with_status(PhaseStatus::Ready)
        .into_iter()
        .take(capacity)
        .collect();
    for name in to_start {
        if let Some(phase) = plan.get_mut(&name) {
            phase.status = PhaseStatus::Running;
            actions.push(PhaseAction::Start {
                phase: name,
                attempt: phase.attempt(),
            });
        }
    }
}

fn derive_state(plan: &PhasePlan) -> TaskState {
    if plan.all_terminal() {
        return TaskState::Finished(plan_outcome(plan));
    }
    if plan.awaiting_continue && plan.active().next().is_none() {
        return TaskState::AwaitingContinue;
    }
    TaskState::InProgress
}

fn plan_outcome(plan: &PhasePlan) -> PlanOutcome {
    let failed = plan.names_with_status(PhaseStatus::Failed);
    if failed.is_empty() {
        return PlanOutcome::Completed;
    }
    let dead_ends: Vec<String> = failed
        .iter()
        .filter(|name| plan.dependents_of(name).is_empty())
        .cloned()
        .collect();
    if !dead_ends.is_empty() {
        return PlanOutcome::Failed { phases: dead_ends };
    }
    PlanOutcome::Blocked {
        failed,
        blocked: plan.names_with_status(PhaseStatus::Blocked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::PhaseSpec;

    fn policy(mode: Mode) -> SchedulePolicy {
        SchedulePolicy {
            mode,
            gate: QualityGate::default(),
            max_concurrent: 4,
        }
    }

    fn plan(specs: &[PhaseSpec]) -> PhasePlan {
        PhasePlan::from_specs(specs, 2).expect("valid plan")
    }

    fn chain() -> PhasePlan {
        plan(&[
            PhaseSpec::new("a", "r", &[], &[]),
            PhaseSpec::new("b", "r", &["a"], &[]),
            PhaseSpec::new("c", "r", &["b"], &[]),
        ])
    }

    fn report(phase: &str, attempt: u32, score: u8) -> CompletionReport {
        CompletionReport {
            phase: phase.to_string(),
            attempt,
            quality_score: score,
            summary: None,
        }
    }

    fn started(advance: &Advance) -> Vec<String> {
        advance
            .actions
            .iter()
            .filter_map(|action| match action {
                PhaseAction::Start { phase, .. } => Some(phase.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sequential_chain_never_runs_a_phase_before_its_dependency_completes() {
        let mut plan = chain();
        let policy = policy(Mode::Sequential);

        let first = advance(&mut plan, &policy, &[], false);
        assert_eq!(started(&first), vec!["a"]);
        assert_eq!(plan.status_of("b"), Some(PhaseStatus::Pending));

        // Polling without a report changes nothing.
        let idle = advance(&mut plan, &policy, &[], false);
        assert!(idle.actions.is_empty());
        assert_eq!(plan.status_of("b"), Some(PhaseStatus::Pending));

        let second = advance(&mut plan, &policy, &[report("a", 1, 95)], false);
        assert_eq!(plan.status_of("a"), Some(PhaseStatus::Complete));
        assert_eq!(started(&second), vec!["b"]);
        assert_eq!(plan.status_of("c"), Some(PhaseStatus::Pending));

        advance(&mut plan, &policy, &[report("b", 1, 91)], false);
        let done = advance(&mut plan, &policy, &[report("c", 1, 100)], false);
        assert_eq!(done.state, TaskState::Finished(PlanOutcome::Completed));
    }

    #[test]
    fn parallel_mode_runs_independent_phases_together() {
        let mut plan = plan(&[
            PhaseSpec::new("x", "r", &[], &[]),
            PhaseSpec::new("y", "r", &[], &[]),
            PhaseSpec::new("join", "r", &["x", "y"], &[]),
        ]);
        let policy = policy(Mode::Parallel);

        let first = advance(&mut plan, &policy, &[], false);
        assert_eq!(started(&first), vec!["x", "y"]);
        assert_eq!(plan.active().count(), 2);

        // Fan-in: join waits for both.
        let after_x = advance(&mut plan, &policy, &[report("x", 1, 99)], false);
        assert!(started(&after_x).is_empty());
        assert_eq!(plan.status_of("join"), Some(PhaseStatus::Pending));

        let after_y = advance(&mut plan, &policy, &[report("y", 1, 99)], false);
        assert_eq!(started(&after_y), vec!["join"]);
    }

    #[test]
    fn sequential_mode_starts_independent_phases_one_at_a_time() {
        let mut plan = plan(&[
            PhaseSpec::new("x", "r", &[], &[]),
            PhaseSpec::new("y", "r", &[], &[]),
        ]);
        let policy = policy(Mode::Sequential);
        let first = advance(&mut plan, &policy, &[], false);
        assert_eq!(started(&first), vec!["x"]);
        assert_eq!(plan.status_of("y"), Some(PhaseStatus::Ready));
    }

    #[test]
    fn fan_out_respects_concurrency_cap() {
        let mut plan = plan(&[
            PhaseSpec::new("a", "r", &[], &[]),
            PhaseSpec::new("b", "r", &[], &[]),
            PhaseSpec::new("c", "r", &[], &[]),
        ]);
        let policy = SchedulePolicy {
            max_concurrent: 2,
            ..policy(Mode::Autonomous)
        };
        let first = advance(&mut plan, &policy, &[], false);
        assert_eq!(started(&first), vec!["a", "b"]);
        let next = advance(&mut plan, &policy, &[report("a", 1, 90)], false);
        assert_eq!(started(&next), vec!["c"]);
    }

    #[test]
    fn low_scores_fail_after_exactly_max_iterations() {
        let mut plan = plan(&[PhaseSpec::new("a", "r", &[], &[])]);
        let policy = policy(Mode::Sequential);
        advance(&mut plan, &policy, &[], false);

        let mut refinements = 0;
        for attempt in 1..=10 {
            let step = advance(&mut plan, &policy, &[report("a", attempt, 40)], false);
            refinements += step
                .actions
                .iter()
                .filter(|action| matches!(action, PhaseAction::Refine { .. }))
                .count();
            let phase = plan.get("a").expect("phase");
            assert!(phase.iteration_count <= phase.max_iterations);
            if phase.status == PhaseStatus::Failed {
                assert_eq!(attempt, 3);
                break;
            }
            assert_eq!(phase.status, PhaseStatus::Iterating);
        }
        assert_eq!(refinements, 2);
        assert_eq!(plan.get("a").map(|p| p.iteration_count), Some(2));
    }

    #[test]
    fn refinement_that_passes_completes_the_phase() {
        let mut plan = plan(&[PhaseSpec::new("a", "r", &[], &[])]);
        let policy = policy(Mode::Sequential);
        advance(&mut plan, &policy, &[], false);
        let low = advance(&mut plan, &policy, &[report("a", 1, 70)], false);
        assert_eq!(
            low.actions,
            vec![PhaseAction::Refine {
                phase: "a".to_string(),
                attempt: 2,
                quality_score: 70
            }]
        );
        let done = advance(&mut plan, &policy, &[report("a", 2, 92)], false);
        assert_eq!(done.state, TaskState::Finished(PlanOutcome::Completed));
        assert_eq!(plan.get("a").and_then(|p| p.quality_score), Some(92));
    }

    #[test]
    fn stale_and_unknown_reports_are_ignored() {
        let mut plan = chain();
        let policy = policy(Mode::Sequential);
        advance(&mut plan, &policy, &[], false);
        advance(&mut plan, &policy, &[report("a", 1, 50)], false);

        let stale = advance(
            &mut plan,
            &policy,
            &[report("a", 1, 50), report("ghost", 1, 100), report("c", 1, 100)],
            false,
        );
        assert!(stale.actions.is_empty());
        assert_eq!(plan.get("a").map(|p| p.attempt()), Some(2));
        assert_eq!(plan.status_of("c"), Some(PhaseStatus::Pending));
    }

    #[test]
    fn failure_blocks_dependents_and_reports_blocked() {
        let mut plan = chain();
        let policy = SchedulePolicy {
            gate: QualityGate {
                threshold: 90,
                max_iterations: 0,
            },
            ..policy(Mode::Sequential)
        };
        for phase in &mut plan.phases {
            phase.max_iterations = 0;
        }
        advance(&mut plan, &policy, &[], false);
        let step = advance(&mut plan, &policy, &[report("a", 1, 10)], false);

        assert_eq!(plan.status_of("b"), Some(PhaseStatus::Blocked));
        assert_eq!(plan.status_of("c"), Some(PhaseStatus::Blocked));
        assert_eq!(
            step.state,
            TaskState::Finished(PlanOutcome::Blocked {
                failed: vec!["a".to_string()],
                blocked: vec!["b".to_string(), "c".to_string()],
            })
        );
    }

    #[test]
    fn failure_of_a_leaf_phase_fails_the_task() {
        let mut plan = chain();
        let policy = policy(Mode::Sequential);
        for phase in &mut plan.phases {
            phase.max_iterations = 0;
        }
        advance(&mut plan, &policy, &[], false);
        advance(&mut plan, &policy, &[report("a", 1, 95)], false);
        advance(&mut plan, &policy, &[report("b", 1, 95)], false);
        let step = advance(&mut plan, &policy, &[report("c", 1, 5)], false);
        assert_eq!(
            step.state,
            TaskState::Finished(PlanOutcome::Failed {
                phases: vec!["c".to_string()]
            })
        );
    }

    #[test]
    fn parallel_sibling_keeps_running_after_a_failure() {
        let mut plan = plan(&[
            PhaseSpec::new("x", "r", &[], &[]),
            PhaseSpec::new("y", "r", &[], &[]),
        ]);
        for phase in &mut plan.phases {
            phase.max_iterations = 0;
        }
        let policy = policy(Mode::Parallel);
        advance(&mut plan, &policy, &[], false);
        let step = advance(&mut plan, &policy, &[report("x", 1, 1)], false);
        assert_eq!(step.state, TaskState::InProgress);
        assert_eq!(plan.status_of("y"), Some(PhaseStatus::Running));
    }

    #[test]
    fn conservative_mode_pauses_until_continue() {
        let mut plan = chain();
        let policy = policy(Mode::Conservative);
        advance(&mut plan, &policy, &[], false);

        let paused = advance(&mut plan, &policy, &[report("a", 1, 95)], false);
        assert_eq!(paused.state, TaskState::AwaitingContinue);
        assert!(started(&paused).is_empty());
        assert_eq!(plan.status_of("b"), Some(PhaseStatus::Ready));

        let still = advance(&mut plan, &policy, &[], false);
        assert_eq!(still.state, TaskState::AwaitingContinue);

        let resumed = advance(&mut plan, &policy, &[], true);
        assert_eq!(started(&resumed), vec!["b"]);
        assert_eq!(resumed.state, TaskState::InProgress);
    }

    #[test]
    fn conservative_mode_finishes_without_waiting_after_last_phase() {
        let mut plan = plan(&[PhaseSpec::new("only", "r", &[], &[])]);
        let policy = policy(Mode::Conservative);
        advance(&mut plan, &policy, &[], false);
        let done = advance(&mut plan, &policy, &[report("only", 1, 90)], false);
        assert_eq!(done.state, TaskState::Finished(PlanOutcome::Completed));
        assert!(!plan.awaiting_continue);
    }

    #[test]
    fn abort_reconciles_running_and_pending_phases() {
        let mut plan = chain();
        let policy = policy(Mode::Sequential);
        advance(&mut plan, &policy, &[], false);
        let actions = abort(&mut plan, "cancelled by operator");
        assert_eq!(plan.status_of("a"), Some(PhaseStatus::Failed));
        assert_eq!(plan.status_of("b"), Some(PhaseStatus::Blocked));
        assert_eq!(plan.status_of("c"), Some(PhaseStatus::Blocked));
        assert_eq!(actions.len(), 3);
        assert!(plan.active().next().is_none());
    }
}
