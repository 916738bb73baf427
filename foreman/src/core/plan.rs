//! Phase graph: definitions, validation and lookups.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::types::PhaseStatus;

/// Phase template as written in `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
}

impl PhaseSpec {
    pub fn new(name: &str, role: &str, depends_on: &[&str], deliverables: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            deliverables: deliverables.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Default graph: plan, then build and tests side by side, then verify, then report.
pub fn default_phase_specs() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new(
            "plan",
            "planner",
            &[],
            &["PLAN.md with the work breakdown and acceptance criteria"],
        ),
        PhaseSpec::new(
            "build",
            "builder",
            &["plan"],
            &["implementation committed on the workspace branch"],
        ),
        PhaseSpec::new(
            "tests",
            "test-writer",
            &["plan"],
            &["automated tests covering the acceptance criteria"],
        ),
        PhaseSpec::new(
            "verify",
            "verifier",
            &["build", "tests"],
            &["VERIFY.md with test results and review findings"],
        ),
        PhaseSpec::new(
            "report",
            "reporter",
            &["verify"],
            &["REPORT.md summarising what changed and what remains"],
        ),
    ]
}

/// Runtime state of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    pub status: PhaseStatus,
    pub quality_score: Option<u8>,
    pub iteration_count: u32,
    pub max_iterations: u32,
    /// Why the phase failed or was blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Phase {
    pub fn from_spec(spec: &PhaseSpec, max_iterations: u32) -> Self {
        Self {
            name: spec.name.clone(),
            role: spec.role.clone(),
            depends_on: spec.depends_on.iter().cloned().collect(),
            deliverables: spec.deliverables.clone(),
            status: PhaseStatus::Pending,
            quality_score: None,
            iteration_count: 0,
            max_iterations,
            reason: None,
        }
    }

    /// One-based number of the attempt currently (or next) in flight.
    pub fn attempt(&self) -> u32 {
        self.iteration_count + 1
    }
}

/// Ordered set of phases plus scheduler bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    pub phases: Vec<Phase>,
    /// Conservative mode: a phase completed and no continue has been received yet.
    #[serde(default)]
    pub awaiting_continue: bool,
}

impl PhasePlan {
    /// Build a plan from specs, rejecting graphs that violate invariants.
    pub fn from_specs(specs: &[PhaseSpec], max_iterations: u32) -> Result<Self, Vec<String>> {
        let errors = validate_phase_specs(specs);
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            phases: specs
                .iter()
                .map(|spec| Phase::from_spec(spec, max_iterations))
                .collect(),
            awaiting_continue: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|phase| phase.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<PhaseStatus> {
        self.get(name).map(|phase| phase.status)
    }

    /// Phases that list `name` as a direct dependency.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.phases
            .iter()
            .filter(|phase| phase.depends_on.contains(name))
            .map(|phase| phase.name.clone())
            .collect()
    }

    /// Names of every phase downstream of `name`, in plan order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            for dependent in self.dependents_of(&current) {
                if found.insert(dependent.clone()) {
                    frontier.push(dependent);
                }
            }
        }
        self.phases
            .iter()
            .filter(|phase| found.contains(&phase.name))
            .map(|phase| phase.name.clone())
            .collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter().filter(|phase| phase.status.is_active())
    }

    pub fn all_terminal(&self) -> bool {
        self.phases.iter().all(|phase| phase.status.is_terminal())
    }

    pub fn names_with_status(&self, status: PhaseStatus) -> Vec<String> {
        self.phases
            .iter()
            .filter(|phase| phase.status == status)
            .map(|phase| phase.name.clone())
            .collect()
    }
}

/// True for names safe to embed in file names and completion signals.
pub fn is_valid_phase_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
}

/// Check graph invariants:
/// - at least one phase
/// - names are unique and use `[a-z0-9_-]`
/// - dependencies exist and are not self-references
/// - the graph is acyclic
pub fn validate_phase_specs(specs: &[PhaseSpec]) -> Vec<String> {
    let mut errors = Vec::new();
    if specs.is_empty() {
        errors.push("plan must contain at least one phase".to_string());
        return errors;
    }

    let mut seen = HashSet::new();
    for spec in specs {
        if !is_valid_phase_name(&spec.name) {
            errors.push(format!(
                "phase '{}': name must be non-empty and use only [a-z0-9_-]",
                spec.name
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            errors.push(format!("duplicate phase '{}'", spec.name));
        }
        if spec.role.trim().is_empty() {
            errors.push(format!("phase '{}': role must not be empty", spec.name));
        }
    }

    for spec in specs {
        for dep in &spec.depends_on {
            if dep == &spec.name {
                errors.push(format!("phase '{}' depends on itself", spec.name));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "phase '{}' depends on unknown phase '{}'",
                    spec.name, dep
                ));
            }
        }
    }

    if errors.is_empty()
        && let Some(stuck) = find_cycle_members(specs)
    {
        errors.push(format!(
            "dependency cycle among phases: {}",
            stuck.join(", ")
        ));
    }

    errors
}

/// Kahn's algorithm; returns the phases left over when no progress is possible.
fn find_cycle_members(specs: &[PhaseSpec]) -> Option<Vec<String>> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = specs
        .iter()
        .map(|spec| {
            let deps = spec.depends_on.iter().map(String::as_str).collect();
            (spec.name.as_str(), deps)
        })
        .collect();

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in &ready {
            remaining.remove(name);
        }
        for deps in remaining.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }
    }

    if remaining.is_empty() {
        None
    } else {
        Some(remaining.keys().map(|name| name.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_specs_form_a_valid_plan() {
        let plan = PhasePlan::from_specs(&default_phase_specs(), 2).expect("plan");
        assert_eq!(plan.phases.len(), 5);
        assert!(plan.phases.iter().all(|p| p.status == PhaseStatus::Pending));
        assert_eq!(plan.dependents_of("plan"), vec!["build", "tests"]);
    }

    #[test]
    fn transitive_dependents_follow_the_graph_in_plan_order() {
        let plan = PhasePlan::from_specs(&default_phase_specs(), 2).expect("plan");
        assert_eq!(
            plan.transitive_dependents("build"),
            vec!["verify".to_string(), "report".to_string()]
        );
        assert!(plan.transitive_dependents("report").is_empty());
    }

    #[test]
    fn validation_reports_duplicates_unknown_and_self_dependencies() {
        let specs = vec![
            PhaseSpec::new("a", "r", &["a"], &[]),
            PhaseSpec::new("a", "r", &[], &[]),
            PhaseSpec::new("b", "r", &["ghost"], &[]),
        ];
        let errors = validate_phase_specs(&specs);
        assert!(errors.iter().any(|e| e.contains("duplicate phase 'a'")));
        assert!(errors.iter().any(|e| e.contains("depends on itself")));
        assert!(errors.iter().any(|e| e.contains("unknown phase 'ghost'")));
    }

    #[test]
    fn validation_detects_cycles() {
        let specs = vec![
            PhaseSpec::new("a", "r", &["c"], &[]),
            PhaseSpec::new("b", "r", &["a"], &[]),
            PhaseSpec::new("c", "r", &["b"], &[]),
            PhaseSpec::new("d", "r", &[], &[]),
        ];
        let errors = validate_phase_specs(&specs);
        assert_eq!(errors, vec!["dependency cycle among phases: a, b, c".to_string()]);
    }

    #[test]
    fn validation_rejects_empty_plans_and_bad_names() {
        assert_eq!(
            validate_phase_specs(&[]),
            vec!["plan must contain at least one phase".to_string()]
        );
        let errors = validate_phase_specs(&[PhaseSpec::new("Build Step", "r", &[], &[])]);
        assert!(errors.iter().any(|e| e.contains("[a-z0-9_-]")));
    }
}
