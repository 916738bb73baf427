//! Quality gate applied to every reported phase attempt.

use serde::{Deserialize, Serialize};

pub const DEFAULT_THRESHOLD: u8 = 90;
pub const DEFAULT_MAX_ITERATIONS: u32 = 2;

/// Minimum score and refinement cap for phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGate {
    /// Score (0-100) a phase must reach to complete.
    pub threshold: u8,
    /// Refinement attempts allowed after the first attempt falls short.
    pub max_iterations: u32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// What the gate decides for one reported score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    /// Below threshold with refinements left.
    Iterate,
    /// Below threshold and `iteration_count == max_iterations`.
    Exhausted,
}

impl QualityGate {
    pub fn evaluate(&self, score: u8, iteration_count: u32, max_iterations: u32) -> GateDecision {
        if score >= self.threshold {
            GateDecision::Pass
        } else if iteration_count >= max_iterations {
            GateDecision::Exhausted
        } else {
            GateDecision::Iterate
        }
    }
}
