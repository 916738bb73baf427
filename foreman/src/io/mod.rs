//! Side-effecting adapters: filesystem, git, terminal sessions, subprocesses.

pub mod clock;
pub mod config;
pub mod git;
pub mod mission;
pub mod process;
pub mod reports;
pub mod session;
pub mod task_store;
pub mod workspace;
