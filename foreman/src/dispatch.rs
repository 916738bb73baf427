//! Mission delivery and phase directives.

use std::fs;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::core::plan::PhasePlan;
use crate::core::scheduler::PhaseAction;
use crate::core::types::SessionState;
use crate::error::ForemanError;
use crate::io::config::write_atomic;
use crate::io::mission::{MissionSpec, refine_directive, render_mission, start_directive};
use crate::io::session::{Session, SessionManager};
use crate::io::workspace::{Workspace, WorkspaceLayout};

/// Write `MISSION.md` and send the directives for the first phases.
///
/// Only valid once the session is ready. Artifacts from an earlier run of the
/// same task (reports, markers, control files) are cleared first so they
/// cannot complete phases of this run. Any failure is a dispatch error.
#[instrument(skip_all, fields(task_id = spec.task_id, session = %session.id))]
pub fn dispatch(
    manager: &SessionManager<'_>,
    session: &mut Session,
    workspace: &Workspace,
    spec: &MissionSpec<'_>,
    initial: &[PhaseAction],
) -> Result<()> {
    if session.state != SessionState::Ready {
        return Err(ForemanError::dispatch(format!(
            "session {} is {:?}, not ready",
            session.id, session.state
        ))
        .into());
    }
    let layout = workspace.layout();
    reset_run_artifacts(&layout).map_err(ForemanError::dispatch)?;

    let mission = render_mission(spec).map_err(ForemanError::dispatch)?;
    write_atomic(&layout.mission_path(), &mission).map_err(ForemanError::dispatch)?;
    info!(path = %layout.mission_path().display(), "mission written");

    for action in initial {
        send_directive(manager, session, spec.plan, action, spec.run, spec.gate.threshold)
            .map_err(ForemanError::dispatch)?;
    }
    Ok(())
}

/// Send the session instruction for a `Start` or `Refine` action of
/// dispatch `run`.
///
/// Returns `false` for actions that need no instruction.
pub fn send_directive(
    manager: &SessionManager<'_>,
    session: &mut Session,
    plan: &PhasePlan,
    action: &PhaseAction,
    run: &str,
    threshold: u8,
) -> Result<bool> {
    let (name, text) = match action {
        PhaseAction::Start { phase, .. } => {
            let state = plan
                .get(phase)
                .ok_or_else(|| anyhow!("unknown phase '{phase}'"))?;
            (phase, start_directive(state, run)?)
        }
        PhaseAction::Refine {
            phase,
            quality_score,
            ..
        } => {
            let state = plan
                .get(phase)
                .ok_or_else(|| anyhow!("unknown phase '{phase}'"))?;
            (phase, refine_directive(state, run, *quality_score, threshold)?)
        }
        _ => return Ok(false),
    };
    manager
        .send(session, &text)
        .with_context(|| format!("send directive for phase '{name}'"))?;
    info!(phase = %name, "directive sent");
    Ok(true)
}

fn reset_run_artifacts(layout: &WorkspaceLayout) -> Result<()> {
    for dir in [layout.reports_dir(), layout.markers_dir()] {
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("clear {}", dir.display()))?;
        }
    }
    for file in [layout.continue_path(), layout.cancel_path()] {
        if file.exists() {
            fs::remove_file(&file).with_context(|| format!("remove {}", file.display()))?;
        }
    }
    layout.ensure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::QualityGate;
    use crate::core::plan::default_phase_specs;
    use crate::core::scheduler::{SchedulePolicy, advance};
    use crate::core::types::Mode;
    use crate::io::config::CleanupConfig;
    use crate::test_support::ScriptedHost;
    use chrono::Utc;

    fn workspace(root: &std::path::Path) -> Workspace {
        let ws = Workspace {
            path: root.to_path_buf(),
            branch: "foreman/t".to_string(),
            created_at: Utc::now(),
            cleanup: CleanupConfig::default(),
            attached: false,
        };
        ws.layout().ensure().expect("layout");
        ws
    }

    #[test]
    fn dispatch_writes_mission_and_starts_first_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = workspace(temp.path());
        let layout = ws.layout();
        fs::write(layout.report_path("plan"), "{}").expect("stale report");
        fs::write(layout.cancel_path(), "old").expect("stale cancel");

        let host = ScriptedHost::new(vec!["> "]);
        let manager = SessionManager::new(&host);
        let mut session = manager.start("foreman-t", temp.path(), &["w".to_string()]).expect("start");
        manager.set_state(&mut session, SessionState::Ready);

        let mut plan = PhasePlan::from_specs(&default_phase_specs(), 2).expect("plan");
        let policy = SchedulePolicy {
            mode: Mode::Sequential,
            gate: QualityGate::default(),
            max_concurrent: 4,
        };
        let first = advance(&mut plan, &policy, &[], false);
        let spec = MissionSpec {
            task_id: "t",
            description: "do the thing",
            mode: Mode::Sequential,
            branch: "foreman/t",
            run: "5eed",
            plan: &plan,
            gate: QualityGate::default(),
        };
        dispatch(&manager, &mut session, &ws, &spec, &first.actions).expect("dispatch");

        let mission = fs::read_to_string(layout.mission_path()).expect("mission");
        assert!(mission.contains("do the thing"));
        assert!(!layout.report_path("plan").exists());
        assert!(!layout.cancel_path().exists());
        let sent = host.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Begin phase 'plan'"));
        assert!(sent[0].contains("FOREMAN-DONE run=5eed phase=plan attempt=1"));
        assert_eq!(session.state, SessionState::Busy);
    }

    #[test]
    fn dispatch_before_ready_is_a_dispatch_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = workspace(temp.path());
        let host = ScriptedHost::new(vec!["booting"]);
        let manager = SessionManager::new(&host);
        let mut session = manager.start("foreman-t", temp.path(), &["w".to_string()]).expect("start");
        let plan = PhasePlan::from_specs(&default_phase_specs(), 2).expect("plan");
        let spec = MissionSpec {
            task_id: "t",
            description: "x",
            mode: Mode::Conservative,
            branch: "foreman/t",
            run: "5eed",
            plan: &plan,
            gate: QualityGate::default(),
        };
        let err = dispatch(&manager, &mut session, &ws, &spec, &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForemanError>(),
            Some(ForemanError::Dispatch { .. })
        ));
        assert!(!ws.layout().mission_path().exists());
        assert!(host.sent().is_empty());
    }
}
