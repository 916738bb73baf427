//! Terminal outcomes of a task run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a task run ended. Every run ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Blocked,
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Blocked => "blocked",
            TaskOutcome::TimedOut => "timed-out",
            TaskOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(self) -> bool {
        self == TaskOutcome::Completed
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let outcome = match s.trim() {
            "completed" => TaskOutcome::Completed,
            "failed" => TaskOutcome::Failed,
            "blocked" => TaskOutcome::Blocked,
            "timed-out" => TaskOutcome::TimedOut,
            "cancelled" => TaskOutcome::Cancelled,
            other => return Err(format!("unknown outcome '{other}'")),
        };
        Ok(outcome)
    }
}
