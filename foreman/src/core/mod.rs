//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod gate;
pub mod naming;
pub mod outcome;
pub mod plan;
pub mod rules;
pub mod scheduler;
pub mod signals;
pub mod types;
