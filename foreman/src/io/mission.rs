//! Mission document and phase directives rendered from minijinja templates.
//!
//! The mission is the contract the worker reads: objective, phases with roles
//! and deliverables, the mode's parallelism notice, and the quality gate.
//! Directives are the short instructions typed into the session; they are
//! flattened to a single line so the terminal submits them in one go.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::gate::QualityGate;
use crate::core::plan::{Phase, PhasePlan};
use crate::core::signals::completion_line_example;
use crate::core::types::Mode;

const MISSION_TEMPLATE: &str = include_str!("prompts/mission.md");
const START_TEMPLATE: &str = include_str!("prompts/start_phase.txt");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine_phase.txt");

/// Inputs for the mission document.
#[derive(Debug, Clone)]
pub struct MissionSpec<'a> {
    pub task_id: &'a str,
    pub description: &'a str,
    pub mode: Mode,
    pub branch: &'a str,
    /// Token of this dispatch; the worker echoes it in every report.
    pub run: &'a str,
    pub plan: &'a PhasePlan,
    pub gate: QualityGate,
}

#[derive(Debug, Serialize)]
struct PhaseContext<'a> {
    name: &'a str,
    role: &'a str,
    depends_on: Vec<&'a str>,
    deliverables: &'a [String],
}

impl<'a> PhaseContext<'a> {
    fn from_phase(phase: &'a Phase) -> Self {
        Self {
            name: &phase.name,
            role: &phase.role,
            depends_on: phase.depends_on.iter().map(String::as_str).collect(),
            deliverables: &phase.deliverables,
        }
    }
}

struct MissionEngine {
    env: Environment<'static>,
}

impl MissionEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("mission", MISSION_TEMPLATE)
            .expect("mission template should be valid");
        env.add_template("start", START_TEMPLATE)
            .expect("start template should be valid");
        env.add_template("refine", REFINE_TEMPLATE)
            .expect("refine template should be valid");
        Self { env }
    }
}

/// Render `MISSION.md`.
pub fn render_mission(spec: &MissionSpec<'_>) -> Result<String> {
    let engine = MissionEngine::new();
    let phases: Vec<PhaseContext<'_>> = spec.plan.phases.iter().map(PhaseContext::from_phase).collect();
    let rendered = engine.env.get_template("mission")?.render(context! {
        task_id => spec.task_id,
        description => spec.description.trim(),
        mode => spec.mode.as_str(),
        parallelism_notice => spec.mode.parallelism_notice(),
        branch => spec.branch,
        run => spec.run,
        phases => phases,
        threshold => spec.gate.threshold,
        max_iterations => spec.gate.max_iterations,
        completion_example => completion_line_example(spec.run, "<phase>", 1).replace("attempt=1", "attempt=<attempt>"),
    })?;
    Ok(rendered)
}

/// One-line instruction to begin the current attempt of `phase`.
pub fn start_directive(phase: &Phase, run: &str) -> Result<String> {
    let engine = MissionEngine::new();
    let rendered = engine.env.get_template("start")?.render(context! {
        phase => &phase.name,
        run => run,
        role => &phase.role,
        attempt => phase.attempt(),
        deliverables => &phase.deliverables,
        completion_example => completion_line_example(run, &phase.name, phase.attempt()),
    })?;
    Ok(single_line(&rendered))
}

/// One-line instruction to refine `phase` after a below-threshold score.
pub fn refine_directive(phase: &Phase, run: &str, score: u8, threshold: u8) -> Result<String> {
    let engine = MissionEngine::new();
    let rendered = engine.env.get_template("refine")?.render(context! {
        phase => &phase.name,
        run => run,
        role => &phase.role,
        score => score,
        threshold => threshold,
        attempt => phase.attempt(),
        max_attempts => phase.max_iterations + 1,
        completion_example => completion_line_example(run, &phase.name, phase.attempt()),
    })?;
    Ok(single_line(&rendered))
}

/// Collapse whitespace runs (including newlines) into single spaces.
fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
