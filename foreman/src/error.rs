//! Fatal error taxonomy for a task run.
//!
//! These errors travel inside `anyhow::Error` and are recovered at the launch
//! boundary with `downcast_ref::<ForemanError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForemanError {
    /// The workspace could not be created or attached.
    #[error("provisioning failed for {path}: {detail}")]
    Provisioning { path: PathBuf, detail: String },

    /// The terminal session host could not be reached.
    #[error("session host unavailable: {detail}")]
    SessionUnavailable { detail: String },

    /// The mission could not be delivered to the workspace or session.
    #[error("dispatch failed: {detail}")]
    Dispatch { detail: String },
}

impl ForemanError {
    pub fn provisioning(path: impl Into<PathBuf>, detail: impl std::fmt::Display) -> Self {
        Self::Provisioning {
            path: path.into(),
            detail: format!("{detail:#}"),
        }
    }

    pub fn session_unavailable(detail: impl std::fmt::Display) -> Self {
        Self::SessionUnavailable {
            detail: format!("{detail:#}"),
        }
    }

    pub fn dispatch(detail: impl std::fmt::Display) -> Self {
        Self::Dispatch {
            detail: format!("{detail:#}"),
        }
    }
}
