//! Persisted entities of the analysis pipeline.
//!
//! Everything here is a plain serde value. Invariants that span several
//! entities (one current status per selection, append-only results) are
//! enforced by the store and the status machine in the `repolens` crate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric repository id as issued by the source-control host.
pub type RepositoryId = u64;

/// Explicit caller identity threaded through every entry point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(login: impl Into<String>) -> Self {
        Self(login.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque, unique id of a saved repository selection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionId(String);

impl SelectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SelectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Immutable snapshot of a repository as reported by the source collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    pub id: RepositoryId,
    /// `owner/name`
    pub full_name: String,
    /// Primary language, when the host detected one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_at: Option<DateTime<Utc>>,
}

impl RepositoryDescriptor {
    /// Short repository name (the part after the last `/`).
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.full_name)
    }
}

/// A user-chosen set of repositories analysed together as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySelection {
    pub id: SelectionId,
    pub owner: OwnerId,
    /// Ordered, duplicate-free
    pub repositories: Vec<RepositoryDescriptor>,
    pub created_at: DateTime<Utc>,
}

impl RepositorySelection {
    pub fn repository_ids(&self) -> BTreeSet<RepositoryId> {
        self.repositories.iter().map(|r| r.id).collect()
    }

    pub fn repository_names(&self) -> Vec<String> {
        self.repositories
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }
}

/// Lifecycle of a selection's analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisState {
    Pending,
    Analyzing,
    Complete,
    Fail,
}

impl AnalysisState {
    pub fn as_label(&self) -> &'static str {
        match self {
            AnalysisState::Pending => "pending",
            AnalysisState::Analyzing => "analyzing",
            AnalysisState::Complete => "complete",
            AnalysisState::Fail => "fail",
        }
    }

    /// Fixed, caller-facing message for a state.
    pub fn message(&self) -> &'static str {
        match self {
            AnalysisState::Pending => "Analysis has not started yet.",
            AnalysisState::Analyzing => "Analysis is in progress. Please check back shortly.",
            AnalysisState::Complete => "Analysis is complete.",
            AnalysisState::Fail => "Analysis failed. Please trigger it again.",
        }
    }
}

impl fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Current status row of a selection (one per selection id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub selection_id: SelectionId,
    pub owner: OwnerId,
    pub state: AnalysisState,
    /// Internal failure detail, retained for operators only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-repository activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub stars: u64,
    pub commits: u64,
    pub pull_requests: u64,
    pub issues: u64,
}

/// Activity counters summed over a selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTotals {
    pub total_stars: u64,
    pub total_commits: u64,
    pub total_pull_requests: u64,
    pub total_issues: u64,
}

impl ActivityTotals {
    pub fn add(&mut self, snapshot: &ActivitySnapshot) {
        self.total_stars += snapshot.stars;
        self.total_commits += snapshot.commits;
        self.total_pull_requests += snapshot.pull_requests;
        self.total_issues += snapshot.issues;
    }
}

/// Scored outcome for a single repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerRepositoryResult {
    pub repository_id: RepositoryId,
    pub full_name: String,
    /// 0..=100
    pub score: u32,
    /// Language -> lines of code
    pub languages: BTreeMap<String, u64>,
    /// Language -> quality score; may be negative
    pub language_quality: BTreeMap<String, f64>,
    /// Human-readable account of the score arithmetic
    pub narrative: String,
    /// Commits per day over the commit history span
    pub commit_frequency: f64,
    pub activity: ActivitySnapshot,
}

/// Narrative part of the role classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiNarrative {
    pub analysis_summary: Vec<String>,
    pub improvement_suggestions: Vec<String>,
}

/// Aggregate result of one analysis run; append-only per selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub selection_id: SelectionId,
    pub owner: OwnerId,
    pub analyzed_at: DateTime<Utc>,
    pub selected_repositories: Vec<String>,
    pub repositories: Vec<PerRepositoryResult>,
    /// Language -> percentage of total lines
    pub language_ratios: BTreeMap<String, f64>,
    /// 0..=100
    pub overall_score: u32,
    pub activity: ActivityTotals,
    pub primary_role: String,
    pub role_score: u32,
    pub ai_analysis: AiNarrative,
}
