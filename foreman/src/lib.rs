//! Launch and supervise interactive worker sessions through multi-phase tasks.
//!
//! A task gets an isolated git worktree and a persistent terminal session
//! running the worker. The supervisor answers configured startup prompts,
//! dispatches a mission, then coordinates the phase graph (dependencies,
//! quality gate, refinement budget) until every phase is terminal. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (naming, rules, phase scheduling).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git worktrees, tmux, task records,
//!   report files, templates). Behind traits where tests need doubles.
//!
//! Orchestration modules ([`automator`], [`dispatch`], [`coordinator`],
//! [`reaper`], [`launch`], [`control`]) combine the two to implement CLI commands.

pub mod automator;
pub mod control;
pub mod coordinator;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod launch;
pub mod logging;
pub mod reaper;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
