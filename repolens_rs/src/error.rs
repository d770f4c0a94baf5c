//! Error taxonomy for the analysis pipeline.
//!
//! Every failure that can abort a run maps onto one variant here. Callers
//! outside the crate only ever see [`AnalysisError::public_message`]; the
//! `Display` text carries internal detail and is meant for logs and the
//! retained failure reason of a status row.

use std::time::Duration;

use repolens_common::{AnalysisState, SelectionId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Missing selection, repository descriptor or result
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Non-zero subprocess exit or an explicit quality-gate error. Never retried.
    #[error("analysis failed: {0}")]
    AnalysisFailure(String),

    /// A collaborator response failed schema validation
    #[error("parsing failed: {0}")]
    Parsing(String),

    /// The owner already saved an identical repository set
    #[error("selection with the same repositories already exists: {existing}")]
    DuplicateSelection { existing: SelectionId },

    /// A run for this selection is already in flight
    #[error("selection {0} is already being analyzed")]
    AlreadyAnalyzing(SelectionId),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: AnalysisState,
        to: AnalysisState,
    },

    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },

    #[error("analysis cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl AnalysisError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        AnalysisError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Fixed human-readable text safe to hand to a caller.
    pub fn public_message(&self) -> &'static str {
        match self {
            AnalysisError::NotFound { .. } => "The requested resource was not found.",
            AnalysisError::AnalysisFailure(_)
            | AnalysisError::Timeout { .. }
            | AnalysisError::Git(_)
            | AnalysisError::Io(_) => "Repository analysis failed.",
            AnalysisError::Parsing(_) => "An analysis service returned an unexpected response.",
            AnalysisError::DuplicateSelection { .. } => {
                "This repository combination has already been saved."
            }
            AnalysisError::AlreadyAnalyzing(_) => "An analysis for this selection is already running.",
            AnalysisError::InvalidTransition { .. } => {
                "The analysis is not in a state that allows this action."
            }
            AnalysisError::Cancelled => "The analysis was cancelled.",
            AnalysisError::Transport(_) => "An analysis service could not be reached.",
            AnalysisError::Storage(_) => "Analysis data could not be stored.",
        }
    }

    /// Errors that mean "try the same request again later".
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Transport(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

impl From<sled::Error> for AnalysisError {
    fn from(e: sled::Error) -> Self {
        AnalysisError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(e: serde_json::Error) -> Self {
        AnalysisError::Storage(format!("serialization: {e}"))
    }
}
