//! Selection management and analysis runs.
//!
//! Every entry point takes the caller's [`OwnerId`] explicitly; a selection
//! owned by someone else is reported as not found.
//!
//! A run walks the selection's repositories through the analyzer, merges the
//! per-repository results, asks the classifier for a role and persists one
//! [`AnalysisResult`]. Any failure on the way, a panic included, leaves the
//! status at `fail` with the reason retained and nothing persisted.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, TryStreamExt, stream};
use repolens_common::{
    AnalysisResult, AnalysisState, AnalysisStatus, OwnerId, PerRepositoryResult,
    RepositoryDescriptor, RepositoryId, RepositorySelection, SelectionId,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity;
use crate::catalog::{GithubCatalog, SourceCatalog, has_new_activity};
use crate::classifier::{AggregateSummary, ChatRoleClassifier, RepositorySummary, RoleClassifier};
use crate::config::{PipelineConfig, RepolensConfig};
use crate::error::{AnalysisError, Result};
use crate::pipeline::{RepositoryAnalyzer, ScanPipeline};
use crate::status::{AnalysisStatusMachine, StatusView, project};
use crate::store::{AnalysisStore, SledStore};

/// Knobs for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    pub repository_timeout: Duration,
    pub parallelism: usize,
    pub freshness_window_days: i64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for OrchestratorSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            repository_timeout: config.repository_timeout(),
            parallelism: config.parallelism.max(1),
            freshness_window_days: config.freshness_window_days,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOptions {
    /// Skip the activity-freshness check
    pub force: bool,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// The owner has no fresh activity; nothing was started
    NoNewActivity,
    Started(RunHandle),
}

/// Handle to a background analysis run.
#[derive(Debug)]
pub struct RunHandle {
    selection_id: SelectionId,
    cancel: CancellationToken,
    join: JoinHandle<Result<AnalysisResult>>,
}

impl RunHandle {
    pub fn selection_id(&self) -> &SelectionId {
        &self.selection_id
    }

    /// Request cancellation; the run ends as `fail`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<AnalysisResult> {
        self.join
            .await
            .map_err(|e| AnalysisError::AnalysisFailure(format!("analysis task aborted: {e}")))?
    }
}

/// Listing entry for a saved selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSummary {
    pub selection_id: SelectionId,
    pub repository_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub state: Option<AnalysisState>,
}

struct Freshness {
    eligible: bool,
    newest: Option<DateTime<Utc>>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}

#[derive(Clone)]
pub struct AnalysisOrchestrator {
    store: Arc<dyn AnalysisStore>,
    status: Arc<AnalysisStatusMachine>,
    catalog: Arc<dyn SourceCatalog>,
    analyzer: Arc<dyn RepositoryAnalyzer>,
    classifier: Arc<dyn RoleClassifier>,
    settings: OrchestratorSettings,
    save_guard: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl AnalysisOrchestrator {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        catalog: Arc<dyn SourceCatalog>,
        analyzer: Arc<dyn RepositoryAnalyzer>,
        classifier: Arc<dyn RoleClassifier>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            status: Arc::new(AnalysisStatusMachine::new(store.clone())),
            store,
            catalog,
            analyzer,
            classifier,
            settings,
            save_guard: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire up the production collaborators from a config.
    ///
    /// The on-disk store is held by this process alone, so any `analyzing`
    /// row found in it was left by a run that never finished and is settled
    /// as `fail` here.
    pub async fn from_config(config: &RepolensConfig) -> Result<Self> {
        let store: Arc<dyn AnalysisStore> = Arc::new(SledStore::open(&config.data_dir)?);
        let catalog: Arc<dyn SourceCatalog> = Arc::new(GithubCatalog::new(&config.github)?);
        let analyzer: Arc<dyn RepositoryAnalyzer> =
            Arc::new(ScanPipeline::new(config, catalog.clone())?);
        let classifier: Arc<dyn RoleClassifier> =
            Arc::new(ChatRoleClassifier::new(&config.classifier)?);
        let orchestrator = Self::new(
            store,
            catalog,
            analyzer,
            classifier,
            OrchestratorSettings::from(&config.pipeline),
        );
        orchestrator.recover_interrupted().await?;
        Ok(orchestrator)
    }

    /// Settle runs a previous process left in `analyzing` as `fail`.
    ///
    /// Only sound while no run is in flight on the same store.
    pub async fn recover_interrupted(&self) -> Result<Vec<SelectionId>> {
        let recovered = self.status.recover_interrupted().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted analyses");
        }
        Ok(recovered)
    }

    /// Cancel every run started through this orchestrator.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Selections
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn repositories(&self, owner: &OwnerId) -> Result<Vec<RepositoryDescriptor>> {
        self.catalog.repositories(owner).await
    }

    /// Save a new selection and mark it `pending`.
    ///
    /// Ids are de-duplicated in order. Saving a set of ids the owner already
    /// saved is rejected with [`AnalysisError::DuplicateSelection`].
    pub async fn save_selection(
        &self,
        owner: &OwnerId,
        repository_ids: &[RepositoryId],
    ) -> Result<RepositorySelection> {
        let mut seen = BTreeSet::new();
        let ids: Vec<RepositoryId> = repository_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let known: HashMap<RepositoryId, RepositoryDescriptor> = self
            .catalog
            .repositories(owner)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        let repositories = ids
            .iter()
            .map(|id| {
                known
                    .get(id)
                    .cloned()
                    .ok_or_else(|| AnalysisError::not_found("repository", id))
            })
            .collect::<Result<Vec<_>>>()?;

        let _held = self.save_guard.lock().await;
        let wanted: BTreeSet<RepositoryId> = ids.iter().copied().collect();
        if let Some(existing) = self
            .store
            .selections_for_owner(owner)
            .await?
            .into_iter()
            .find(|s| s.repository_ids() == wanted)
        {
            return Err(AnalysisError::DuplicateSelection {
                existing: existing.id,
            });
        }

        let selection = RepositorySelection {
            id: SelectionId::new(Uuid::new_v4().to_string()),
            owner: owner.clone(),
            repositories,
            created_at: Utc::now(),
        };
        self.store.insert_selection(&selection).await?;
        self.status.mark_pending(owner, &selection.id).await?;
        info!(owner = %owner, selection = %selection.id, repositories = selection.repositories.len(), "selection saved");
        Ok(selection)
    }

    pub async fn selections(&self, owner: &OwnerId) -> Result<Vec<SelectionSummary>> {
        let mut out = Vec::new();
        for selection in self.store.selections_for_owner(owner).await? {
            let state = self.store.status(&selection.id).await?.map(|s| s.state);
            out.push(SelectionSummary {
                repository_names: selection.repository_names(),
                selection_id: selection.id,
                created_at: selection.created_at,
                state,
            });
        }
        Ok(out)
    }

    /// Delete a selection with its status history and all results.
    pub async fn delete_selection(&self, owner: &OwnerId, id: &SelectionId) -> Result<()> {
        self.owned_selection(owner, id).await?;
        if !self.status.remove(id).await? {
            return Err(AnalysisError::not_found("selection", id));
        }
        info!(owner = %owner, selection = %id, "selection deleted");
        Ok(())
    }

    async fn owned_selection(&self, owner: &OwnerId, id: &SelectionId) -> Result<RepositorySelection> {
        match self.store.selection(id).await? {
            Some(selection) if &selection.owner == owner => Ok(selection),
            _ => Err(AnalysisError::not_found("selection", id)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a background run if the owner has fresh activity (or `force`).
    ///
    /// Returns as soon as the selection is marked `analyzing`.
    pub async fn trigger(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
        options: TriggerOptions,
    ) -> Result<TriggerOutcome> {
        let selection = self.owned_selection(owner, id).await?;

        if options.force {
            self.status.begin(owner, id).await?;
        } else {
            let freshness = self.check_activity(owner).await?;
            if !freshness.eligible {
                self.mark_seen(owner, freshness.newest).await?;
                info!(owner = %owner, selection = %id, "no new activity, analysis not started");
                return Ok(TriggerOutcome::NoNewActivity);
            }
            // a rejected begin must not consume the activity
            self.status.begin(owner, id).await?;
            // the run goes ahead regardless; at worst the next check sees the events again
            if let Err(e) = self.mark_seen(owner, freshness.newest).await {
                warn!(owner = %owner, error = %e, "could not record seen activity");
            }
        }

        let cancel = self.shutdown.child_token();
        let this = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { this.execute(&selection, &token).await });
        Ok(TriggerOutcome::Started(RunHandle {
            selection_id: id.clone(),
            cancel,
            join,
        }))
    }

    /// Run an analysis in the caller's task.
    pub async fn run_now(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult> {
        let selection = self.owned_selection(owner, id).await?;
        self.status.begin(owner, id).await?;
        self.execute(&selection, cancel).await
    }

    async fn check_activity(&self, owner: &OwnerId) -> Result<Freshness> {
        let events = self.catalog.recent_events(owner).await?;
        let last_seen = self.store.last_seen_event(owner).await?;
        let eligible = has_new_activity(
            &events,
            last_seen,
            Utc::now(),
            self.settings.freshness_window_days,
        );
        debug!(owner = %owner, events = events.len(), eligible, "activity freshness checked");
        Ok(Freshness {
            eligible,
            newest: events.iter().map(|e| e.created_at).max(),
        })
    }

    async fn mark_seen(&self, owner: &OwnerId, newest: Option<DateTime<Utc>>) -> Result<()> {
        match newest {
            Some(at) => self.store.record_seen_event(owner, at).await,
            None => Ok(()),
        }
    }

    /// Run the pipeline and settle the status. Expects `analyzing`.
    async fn execute(
        &self,
        selection: &RepositorySelection,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult> {
        let owner = &selection.owner;
        let id = &selection.id;

        let pipeline = AssertUnwindSafe(self.run_pipeline(selection, cancel));
        let outcome = match FutureExt::catch_unwind(pipeline).await {
            Ok(Ok(result)) => self
                .status
                .complete_with(owner, id, &result)
                .await
                .map(|_| result),
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(AnalysisError::AnalysisFailure(format!(
                "analysis panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match outcome {
            Ok(result) => {
                info!(selection = %id, score = result.overall_score, role = %result.primary_role, "analysis complete");
                Ok(result)
            }
            Err(e) => {
                error!(selection = %id, error = %e, "analysis failed");
                if let Err(status_err) = self.status.fail(owner, id, e.to_string()).await {
                    warn!(selection = %id, error = %status_err, "could not record failure");
                }
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        selection: &RepositorySelection,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult> {
        let results = self.analyze_all(&selection.repositories, cancel).await?;

        let merged = activity::merge_languages(&results);
        let language_ratios = activity::language_ratios(&merged);
        let overall_score = activity::overall_score(&results);
        let totals = activity::activity_totals(&results);

        let summary = AggregateSummary {
            selected_repositories: selection.repository_names(),
            overall_score,
            language_ratios: language_ratios.clone(),
            language_quality: activity::average_language_quality(&results),
            activity: totals,
            repositories: results
                .iter()
                .map(|r| RepositorySummary {
                    name: r.full_name.clone(),
                    score: r.score,
                    commit_frequency: r.commit_frequency,
                    languages: r.languages.clone(),
                })
                .collect(),
        };
        let assessment = tokio::select! {
            a = self.classifier.classify(&summary) => a?,
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
        };

        Ok(AnalysisResult {
            selection_id: selection.id.clone(),
            owner: selection.owner.clone(),
            analyzed_at: Utc::now(),
            selected_repositories: summary.selected_repositories,
            repositories: results,
            language_ratios,
            overall_score,
            activity: totals,
            primary_role: assessment.primary_role,
            role_score: assessment.role_score,
            ai_analysis: assessment.ai_analysis,
        })
    }

    /// Results in selection order; the first failure aborts the rest.
    async fn analyze_all(
        &self,
        repositories: &[RepositoryDescriptor],
        cancel: &CancellationToken,
    ) -> Result<Vec<PerRepositoryResult>> {
        if self.settings.parallelism <= 1 {
            let mut results = Vec::with_capacity(repositories.len());
            for repository in repositories {
                results.push(self.analyze_one(repository, cancel).await?);
            }
            return Ok(results);
        }
        let runs: Vec<_> = repositories
            .iter()
            .map(|repository| self.analyze_one(repository, cancel))
            .collect();
        stream::iter(runs)
            .buffered(self.settings.parallelism)
            .try_collect()
            .await
    }

    async fn analyze_one(
        &self,
        repository: &RepositoryDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PerRepositoryResult> {
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let limit = self.settings.repository_timeout;
        match tokio::time::timeout(limit, self.analyzer.analyze(repository, cancel)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(repo = %repository.full_name, ?limit, "repository analysis timed out");
                Err(AnalysisError::Timeout {
                    stage: "repository analysis",
                    elapsed: limit,
                })
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Report for a completed analysis, otherwise only `{status, message}`.
    pub async fn status(&self, owner: &OwnerId, id: &SelectionId) -> Result<StatusView> {
        self.owned_selection(owner, id).await?;
        let current = self
            .status
            .current(id)
            .await?
            .ok_or_else(|| AnalysisError::not_found("analysis status", id))?;
        let latest = match current.state {
            AnalysisState::Complete => self.store.latest_result(id).await?,
            _ => None,
        };
        project(&current, latest.as_ref())
    }

    pub async fn history(&self, owner: &OwnerId, id: &SelectionId) -> Result<Vec<AnalysisStatus>> {
        self.owned_selection(owner, id).await?;
        self.store.status_history(id).await
    }

    pub async fn latest_result(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
    ) -> Result<Option<AnalysisResult>> {
        self.owned_selection(owner, id).await?;
        self.store.latest_result(id).await
    }

    pub async fn results(&self, owner: &OwnerId, id: &SelectionId) -> Result<Vec<AnalysisResult>> {
        self.owned_selection(owner, id).await?;
        self.store.results(id).await
    }
}
