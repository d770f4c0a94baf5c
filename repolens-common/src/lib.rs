//! Shared data model for the repolens crates.
//!
//! This crate holds the persisted shapes of the analysis pipeline (selections,
//! statuses, per-repository and aggregate results) plus the score ladders used
//! when results are presented, so storage backends and front ends agree on a
//! single serde representation.

mod grade;
mod model;

pub use grade::{Grade, language_level};
pub use model::{
    ActivitySnapshot, ActivityTotals, AiNarrative, AnalysisResult, AnalysisState, AnalysisStatus,
    OwnerId, PerRepositoryResult, RepositoryDescriptor, RepositoryId, RepositorySelection,
    SelectionId,
};
