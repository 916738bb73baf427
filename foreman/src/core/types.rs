//! Shared deterministic types for foreman core logic.
//!
//! These types define stable contracts between the supervision components and
//! the persisted task record. They carry no I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Execution policy for a task. Only the phase scheduler branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sequential,
    Parallel,
    Autonomous,
    #[default]
    Conservative,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::Sequential,
        Mode::Parallel,
        Mode::Autonomous,
        Mode::Conservative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Sequential => "sequential",
            Mode::Parallel => "parallel",
            Mode::Autonomous => "autonomous",
            Mode::Conservative => "conservative",
        }
    }

    /// True if independent ready phases may run at the same time.
    pub fn allows_fan_out(self) -> bool {
        matches!(self, Mode::Parallel | Mode::Autonomous)
    }

    /// True if the scheduler waits for an explicit continue after each completion.
    pub fn pauses_between_phases(self) -> bool {
        matches!(self, Mode::Conservative)
    }

    /// Human-readable scheduling notice embedded in the mission document.
    pub fn parallelism_notice(self) -> &'static str {
        match self {
            Mode::Sequential => {
                "Phases run strictly one at a time in the listed order. Do not start a phase until you are told to."
            }
            Mode::Parallel => {
                "Independent phases may be started together. A phase only starts once all of its dependencies are complete."
            }
            Mode::Autonomous => {
                "Independent phases may be started together and the run proceeds without operator checkpoints."
            }
            Mode::Conservative => {
                "Phases run one at a time. After each completed phase the run pauses until the operator confirms it may continue."
            }
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown mode '{s}' (expected sequential|parallel|autonomous|conservative)")
            })
    }
}

/// Lifecycle of a hosted worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Starting,
    AwaitingApproval,
    Ready,
    Busy,
    Terminated,
}

/// Status of a single phase in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    Pending,
    Ready,
    Running,
    AwaitingGate,
    Iterating,
    Complete,
    Failed,
    /// An upstream phase failed; terminal and never retried.
    Blocked,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Ready => "ready",
            PhaseStatus::Running => "running",
            PhaseStatus::AwaitingGate => "awaiting-gate",
            PhaseStatus::Iterating => "iterating",
            PhaseStatus::Complete => "complete",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Blocked => "blocked",
        }
    }

    /// The worker is currently executing an attempt of this phase.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PhaseStatus::Running | PhaseStatus::AwaitingGate | PhaseStatus::Iterating
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseStatus::Complete | PhaseStatus::Failed | PhaseStatus::Blocked
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Parallel".parse::<Mode>(), Ok(Mode::Parallel));
        assert_eq!(" autonomous ".parse::<Mode>(), Ok(Mode::Autonomous));
        assert!("turbo".parse::<Mode>().is_err());
    }

    #[test]
    fn default_mode_is_conservative() {
        assert_eq!(Mode::default(), Mode::Conservative);
    }

    #[test]
    fn only_parallel_modes_fan_out() {
        let fan_out: Vec<Mode> = Mode::ALL
            .into_iter()
            .filter(|mode| mode.allows_fan_out())
            .collect();
        assert_eq!(fan_out, vec![Mode::Parallel, Mode::Autonomous]);
        assert!(Mode::Conservative.pauses_between_phases());
        assert!(!Mode::Sequential.pauses_between_phases());
    }

    #[test]
    fn phase_status_serializes_kebab_case() {
        let json = serde_json::to_string(&PhaseStatus::AwaitingGate).expect("serialize");
        assert_eq!(json, "\"awaiting-gate\"");
        assert!(PhaseStatus::Iterating.is_active());
        assert!(PhaseStatus::Blocked.is_terminal());
        assert!(!PhaseStatus::Ready.is_active());
    }
}
