//! Per-repository analysis: mirror, scan, wait for the gate, score.

use std::sync::Arc;

use async_trait::async_trait;
use repolens_common::{PerRepositoryResult, RepositoryDescriptor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::activity::commit_frequency;
use crate::catalog::SourceCatalog;
use crate::config::RepolensConfig;
use crate::error::{AnalysisError, Result};
use crate::lint;
use crate::mirror::{SourceMirror, WorkspaceLocks, project_key};
use crate::quality_gate::{QualityGateClient, QualityGatePoller};
use crate::runner::StaticAnalysisRunner;
use crate::scoring::{self, SeverityTally};

/// Produces the scored result for one repository.
#[async_trait]
pub trait RepositoryAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        repository: &RepositoryDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PerRepositoryResult>;
}

/// The real analyzer backed by git, the scanner and the quality gate.
pub struct ScanPipeline {
    mirror: SourceMirror,
    locks: WorkspaceLocks,
    runner: StaticAnalysisRunner,
    poller: QualityGatePoller,
    catalog: Arc<dyn SourceCatalog>,
    engine_id: String,
    lint_language: String,
    lint_extensions: Vec<String>,
}

impl ScanPipeline {
    pub fn new(config: &RepolensConfig, catalog: Arc<dyn SourceCatalog>) -> Result<Self> {
        let client = QualityGateClient::new(&config.quality_gate)?;
        Ok(Self {
            mirror: SourceMirror::new(&config.mirror),
            locks: WorkspaceLocks::new(),
            runner: StaticAnalysisRunner::new(&config.scanner, &config.quality_gate),
            poller: QualityGatePoller::new(client, config.poll.clone()),
            catalog,
            engine_id: config.quality_gate.lint_engine_id.clone(),
            lint_language: config.scanner.lint_language.clone(),
            lint_extensions: config.scanner.lint_extensions.clone(),
        })
    }
}

#[async_trait]
impl RepositoryAnalyzer for ScanPipeline {
    async fn analyze(
        &self,
        repository: &RepositoryDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PerRepositoryResult> {
        let key = project_key(&repository.full_name);
        info!(repo = %repository.full_name, project = %key, "analyzing repository");

        // one writer per working copy while it is cloned and scanned
        let (scan, lint_lines) = {
            let _workspace = self.locks.acquire(&key).await;
            let workdir = self.mirror.ensure(repository).await?;
            let scan = self.runner.run(repository, &workdir, cancel).await?;
            let lint_lines = if scan.external_report.is_some() {
                let extensions = self.lint_extensions.clone();
                tokio::task::spawn_blocking(move || lint::count_lines(&workdir, &extensions))
                    .await
                    .map_err(|e| AnalysisError::AnalysisFailure(format!("line count aborted: {e}")))?
            } else {
                0
            };
            (scan, lint_lines)
        };

        let gate = self.poller.wait_for_gate(&scan.project_key, cancel).await?;
        let base = scoring::base_score(&gate.conditions);

        let client = self.poller.client();
        let languages = client.language_distribution(&scan.project_key).await?;
        let measures = client.language_measures(&scan.project_key).await?;
        let language_quality = scoring::language_quality_scores(&measures);

        let (tally, lint) = if scan.external_report.is_some() {
            let issues = client.issues(&scan.project_key, &self.engine_id).await?;
            (
                SeverityTally::from_issues(&issues),
                Some((self.lint_language.as_str(), lint_lines)),
            )
        } else {
            (SeverityTally::default(), None)
        };
        let scored = scoring::score_repository(base, tally, languages, language_quality, lint);
        debug!(project = %scan.project_key, narrative = %scored.narrative, "scored");

        let activity = self.catalog.activity(repository).await?;
        let frequency = commit_frequency(&activity.commit_dates);

        info!(
            repo = %repository.full_name,
            score = scored.score,
            base = base.score,
            lint_penalty = tally.penalty,
            "repository scored"
        );
        Ok(PerRepositoryResult {
            repository_id: repository.id,
            full_name: repository.full_name.clone(),
            score: scored.score,
            languages: scored.languages,
            language_quality: scored.language_quality,
            narrative: scored.narrative,
            commit_frequency: frequency,
            activity: activity.snapshot(repository.stargazers_count),
        })
    }
}
