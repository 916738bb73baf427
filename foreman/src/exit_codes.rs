//! Stable exit codes for foreman CLI commands.

use crate::core::outcome::TaskOutcome;

/// Command succeeded, or the launched task completed.
pub const OK: i32 = 0;
/// Invalid input, configuration or task id, or an unexpected error.
pub const INVALID: i32 = 1;
/// The task ended `failed`.
pub const FAILED: i32 = 2;
/// The task ended `blocked`.
pub const BLOCKED: i32 = 3;
/// The task ended `timed-out`.
pub const TIMED_OUT: i32 = 4;
/// The task ended `cancelled`.
pub const CANCELLED: i32 = 5;

pub fn for_outcome(outcome: TaskOutcome) -> i32 {
    match outcome {
        TaskOutcome::Completed => OK,
        TaskOutcome::Failed => FAILED,
        TaskOutcome::Blocked => BLOCKED,
        TaskOutcome::TimedOut => TIMED_OUT,
        TaskOutcome::Cancelled => CANCELLED,
    }
}
