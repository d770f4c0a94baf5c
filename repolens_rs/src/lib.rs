//! # repolens
//!
//! Repository analysis and scoring pipeline. A user saves a selection of their
//! repositories; an analysis run mirrors each one locally, runs a lint pass and
//! the quality-gate scanner over it, waits for the gate verdict, turns the gate
//! conditions and lint findings into a 0..=100 score, merges the per-repository
//! numbers and asks a classifier for the best-fitting job role.
//!
//! ## Library usage
//!
//! ```rust,no_run
//! use repolens::{AnalysisOrchestrator, RepolensConfig, TriggerOptions, TriggerOutcome};
//! use repolens_common::{OwnerId, SelectionId};
//!
//! # async fn demo() -> repolens::Result<()> {
//! let orchestrator = AnalysisOrchestrator::from_config(&RepolensConfig::default()).await?;
//! let owner = OwnerId::new("octocat");
//! let selection = orchestrator.save_selection(&owner, &[1296269]).await?;
//! if let TriggerOutcome::Started(run) = orchestrator
//!     .trigger(&owner, &selection.id, TriggerOptions { force: true })
//!     .await?
//! {
//!     let result = run.wait().await?;
//!     println!("{} -> {}", result.primary_role, result.overall_score);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## CLI usage
//!
//! ```bash
//! repolens --owner octocat repos
//! repolens --owner octocat save 1296269 1300192
//! repolens --owner octocat analyze <selection-id> --force
//! repolens --owner octocat status <selection-id>
//! ```

// ============================================================================
// Collaborators
// ============================================================================

pub mod catalog;
pub mod classifier;
pub mod mirror;
pub mod quality_gate;
pub mod runner;

// ============================================================================
// Scoring and aggregation
// ============================================================================

pub mod activity;
pub mod lint;
pub mod scoring;

// ============================================================================
// Orchestration and state
// ============================================================================

pub mod orchestrator;
pub mod pipeline;
pub mod status;
pub mod store;

// ============================================================================
// Ambient
// ============================================================================

pub mod config;
pub mod error;

pub use catalog::{GithubCatalog, SourceCatalog};
pub use classifier::{ChatRoleClassifier, RoleAssessment, RoleClassifier};
pub use config::{RepolensConfig, load_config};
pub use error::{AnalysisError, Result};
pub use orchestrator::{
    AnalysisOrchestrator, OrchestratorSettings, RunHandle, SelectionSummary, TriggerOptions,
    TriggerOutcome,
};
pub use pipeline::{RepositoryAnalyzer, ScanPipeline};
pub use status::{AnalysisReport, StatusView};
pub use store::{AnalysisStore, MemoryStore, SledStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
