//! Analysis status machine and the caller-facing status projection.
//!
//! ```text
//! (new) -> pending -> analyzing -> complete
//!                        ^   \
//!                        |    -> fail
//!                        +------- complete | fail   (re-trigger)
//! ```
//!
//! A selection never enters `analyzing` twice: the check and the write happen
//! under one lock, so two concurrent triggers cannot both succeed. Deletion
//! takes the same lock, so a selection is never removed mid-run and a run
//! never starts on a removed selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use repolens_common::{
    ActivityTotals, AiNarrative, AnalysisResult, AnalysisState, AnalysisStatus, Grade, OwnerId,
    SelectionId, language_level,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::activity::average_language_quality;
use crate::error::{AnalysisError, Result};
use crate::store::AnalysisStore;

/// Whether `from -> to` is a legal edge (`None` = no status row yet).
pub fn transition_allowed(from: Option<AnalysisState>, to: AnalysisState) -> bool {
    use AnalysisState::*;
    matches!(
        (from, to),
        (None, Pending)
            | (None, Analyzing)
            | (Some(Pending), Analyzing)
            | (Some(Analyzing), Complete)
            | (Some(Analyzing), Fail)
            | (Some(Complete), Analyzing)
            | (Some(Fail), Analyzing)
    )
}

pub struct AnalysisStatusMachine {
    store: Arc<dyn AnalysisStore>,
    guard: Mutex<()>,
}

impl AnalysisStatusMachine {
    pub fn new(store: Arc<dyn AnalysisStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    pub async fn current(&self, id: &SelectionId) -> Result<Option<AnalysisStatus>> {
        self.store.status(id).await
    }

    /// Initial row for a freshly saved selection.
    pub async fn mark_pending(&self, owner: &OwnerId, id: &SelectionId) -> Result<AnalysisStatus> {
        self.transition(owner, id, AnalysisState::Pending, None).await
    }

    /// Enter `analyzing`; rejected while a run is already in flight or once
    /// the selection is gone.
    pub async fn begin(&self, owner: &OwnerId, id: &SelectionId) -> Result<AnalysisStatus> {
        self.transition(owner, id, AnalysisState::Analyzing, None).await
    }

    /// Persist `result` and enter `complete` together.
    pub async fn complete_with(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
        result: &AnalysisResult,
    ) -> Result<AnalysisStatus> {
        let _held = self.guard.lock().await;
        let (from, status) = self.next(owner, id, AnalysisState::Complete, None).await?;
        self.store.commit_result(result, &status).await?;
        info!(selection = %id, from = ?from, to = %status.state, "status transition");
        Ok(status)
    }

    /// Enter `fail`, retaining the internal reason on the status row.
    pub async fn fail(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
        reason: impl Into<String>,
    ) -> Result<AnalysisStatus> {
        self.transition(owner, id, AnalysisState::Fail, Some(reason.into()))
            .await
    }

    /// Delete a selection with everything recorded for it, unless a run is
    /// in flight. Returns whether the selection existed.
    pub async fn remove(&self, id: &SelectionId) -> Result<bool> {
        let _held = self.guard.lock().await;
        let current = self.store.status(id).await?;
        if current.is_some_and(|s| s.state == AnalysisState::Analyzing) {
            return Err(AnalysisError::AlreadyAnalyzing(id.clone()));
        }
        self.store.delete_selection(id).await
    }

    /// Settle every `analyzing` row left behind by a process that stopped
    /// mid-run as `fail`. Only call this while no run is in flight.
    pub async fn recover_interrupted(&self) -> Result<Vec<SelectionId>> {
        let stale: Vec<AnalysisStatus> = self
            .store
            .statuses()
            .await?
            .into_iter()
            .filter(|s| s.state == AnalysisState::Analyzing)
            .collect();
        let mut recovered = Vec::with_capacity(stale.len());
        for status in stale {
            warn!(selection = %status.selection_id, since = %status.updated_at, "interrupted analysis marked failed");
            self.fail(&status.owner, &status.selection_id, "interrupted before completion")
                .await?;
            recovered.push(status.selection_id);
        }
        Ok(recovered)
    }

    async fn transition(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
        to: AnalysisState,
        reason: Option<String>,
    ) -> Result<AnalysisStatus> {
        let _held = self.guard.lock().await;
        let (from, status) = self.next(owner, id, to, reason).await?;
        self.store.put_status(&status).await?;
        info!(selection = %id, from = ?from, to = %to, "status transition");
        Ok(status)
    }

    /// Validate `to` against the stored row. Caller holds the guard.
    async fn next(
        &self,
        owner: &OwnerId,
        id: &SelectionId,
        to: AnalysisState,
        reason: Option<String>,
    ) -> Result<(Option<AnalysisState>, AnalysisStatus)> {
        let from = self.store.status(id).await?.map(|s| s.state);

        if from == Some(AnalysisState::Analyzing) && to == AnalysisState::Analyzing {
            return Err(AnalysisError::AlreadyAnalyzing(id.clone()));
        }
        if !transition_allowed(from, to) {
            return Err(AnalysisError::InvalidTransition {
                from: from.unwrap_or(AnalysisState::Pending),
                to,
            });
        }
        if to == AnalysisState::Analyzing && self.store.selection(id).await?.is_none() {
            return Err(AnalysisError::not_found("selection", id));
        }

        let status = AnalysisStatus {
            selection_id: id.clone(),
            owner: owner.clone(),
            state: to,
            reason,
            updated_at: Utc::now(),
        };
        Ok((from, status))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Projection
// ─────────────────────────────────────────────────────────────────────────────

/// Full scored projection of a completed analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub selection_id: SelectionId,
    /// `%Y-%m-%d %H:%M:%S`, UTC
    pub analysis_date: String,
    pub selected_repositories: Vec<String>,
    pub language_ratios: BTreeMap<String, f64>,
    /// Language -> 0..=10
    pub language_levels: BTreeMap<String, u8>,
    pub overall_score: u32,
    pub grade: Grade,
    pub activity: ActivityTotals,
    pub primary_role: String,
    pub role_score: u32,
    pub ai_analysis: AiNarrative,
}

impl AnalysisReport {
    pub fn from_result(result: &AnalysisResult) -> Self {
        let language_levels = average_language_quality(&result.repositories)
            .into_iter()
            .map(|(language, avg)| (language, language_level(avg)))
            .collect();
        Self {
            selection_id: result.selection_id.clone(),
            analysis_date: result.analyzed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            selected_repositories: result.selected_repositories.clone(),
            language_ratios: result.language_ratios.clone(),
            language_levels,
            overall_score: result.overall_score,
            grade: Grade::from_score(result.overall_score),
            activity: result.activity,
            primary_role: result.primary_role.clone(),
            role_score: result.role_score,
            ai_analysis: result.ai_analysis.clone(),
        }
    }
}

/// Fixed message for a selection that has no report to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub status: AnalysisState,
    pub message: &'static str,
}

/// What a status query returns: either the report or only `{status, message}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusView {
    Complete(Box<AnalysisReport>),
    InProgress(StatusMessage),
}

impl StatusView {
    pub fn state(&self) -> AnalysisState {
        match self {
            StatusView::Complete(_) => AnalysisState::Complete,
            StatusView::InProgress(m) => m.status,
        }
    }
}

/// Project a status row (and the latest result, if any) for a caller.
pub fn project(status: &AnalysisStatus, latest: Option<&AnalysisResult>) -> Result<StatusView> {
    match status.state {
        AnalysisState::Complete => {
            let result = latest
                .ok_or_else(|| AnalysisError::not_found("analysis result", &status.selection_id))?;
            Ok(StatusView::Complete(Box::new(AnalysisReport::from_result(result))))
        }
        state => Ok(StatusView::InProgress(StatusMessage {
            status: state,
            message: state.message(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use repolens_common::{ActivitySnapshot, PerRepositoryResult, RepositorySelection};

    fn selection(id: &str) -> RepositorySelection {
        RepositorySelection {
            id: SelectionId::new(id),
            owner: OwnerId::new("alice"),
            repositories: vec![],
            created_at: Utc::now(),
        }
    }

    /// Machine over a store that already holds `sel-1`.
    async fn machine() -> (AnalysisStatusMachine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_selection(&selection("sel-1")).await.unwrap();
        (AnalysisStatusMachine::new(store.clone()), store)
    }

    fn ids() -> (OwnerId, SelectionId) {
        (OwnerId::new("alice"), SelectionId::new("sel-1"))
    }

    #[test]
    fn transition_table() {
        use AnalysisState::*;
        assert!(transition_allowed(None, Pending));
        assert!(transition_allowed(Some(Pending), Analyzing));
        assert!(transition_allowed(Some(Fail), Analyzing));
        assert!(transition_allowed(Some(Complete), Analyzing));
        assert!(!transition_allowed(Some(Pending), Complete));
        assert!(!transition_allowed(Some(Complete), Fail));
        assert!(!transition_allowed(Some(Analyzing), Analyzing));
        assert!(!transition_allowed(Some(Fail), Complete));
    }

    #[tokio::test]
    async fn happy_path_and_retrigger() {
        let (m, store) = machine().await;
        let (owner, id) = ids();
        m.mark_pending(&owner, &id).await.unwrap();
        m.begin(&owner, &id).await.unwrap();
        m.fail(&owner, &id, "scanner exited with status 2").await.unwrap();
        let failed = m.current(&id).await.unwrap().unwrap();
        assert_eq!(failed.state, AnalysisState::Fail);
        assert_eq!(failed.reason.as_deref(), Some("scanner exited with status 2"));

        m.begin(&owner, &id).await.unwrap();
        m.complete_with(&owner, &id, &finished(80)).await.unwrap();
        assert_eq!(store.results(&id).await.unwrap().len(), 1);
        m.begin(&owner, &id).await.unwrap();
    }

    #[tokio::test]
    async fn analyzing_is_not_reentrant() {
        let (m, _) = machine().await;
        let (owner, id) = ids();
        m.mark_pending(&owner, &id).await.unwrap();
        m.begin(&owner, &id).await.unwrap();
        let err = m.begin(&owner, &id).await.unwrap_err();
        assert!(matches!(err, AnalysisError::AlreadyAnalyzing(_)));
    }

    #[tokio::test]
    async fn concurrent_begins_admit_exactly_one() {
        let m = Arc::new(machine().await.0);
        let (owner, id) = ids();
        m.mark_pending(&owner, &id).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            let (owner, id) = (owner.clone(), id.clone());
            tasks.push(tokio::spawn(async move { m.begin(&owner, &id).await.is_ok() }));
        }
        let mut admitted = 0;
        for t in tasks {
            if t.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn cannot_complete_without_running() {
        let (m, store) = machine().await;
        let (owner, id) = ids();
        m.mark_pending(&owner, &id).await.unwrap();
        let err = m.complete_with(&owner, &id, &finished(80)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidTransition { .. }));
        // a rejected completion leaves no result behind
        assert!(store.results(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_is_refused_mid_run() {
        let (m, store) = machine().await;
        let (owner, id) = ids();
        m.mark_pending(&owner, &id).await.unwrap();
        m.begin(&owner, &id).await.unwrap();
        let err = m.remove(&id).await.unwrap_err();
        assert!(matches!(err, AnalysisError::AlreadyAnalyzing(_)));
        assert!(store.selection(&id).await.unwrap().is_some());

        m.fail(&owner, &id, "cancelled").await.unwrap();
        assert!(m.remove(&id).await.unwrap());
        assert!(store.selection(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removed_selection_cannot_begin() {
        let (m, store) = machine().await;
        let (owner, id) = ids();
        m.mark_pending(&owner, &id).await.unwrap();
        assert!(m.remove(&id).await.unwrap());

        let err = m.begin(&owner, &id).await.unwrap_err();
        assert!(matches!(err, AnalysisError::NotFound { .. }));
        assert!(store.status(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn racing_begin_and_remove_leave_a_consistent_store() {
        for round in 0..50 {
            let (m, store) = machine().await;
            let m = Arc::new(m);
            let (owner, id) = ids();
            m.mark_pending(&owner, &id).await.unwrap();

            let begin = {
                let (m, owner, id) = (m.clone(), owner.clone(), id.clone());
                tokio::spawn(async move { m.begin(&owner, &id).await.is_ok() })
            };
            let remove = {
                let (m, id) = (m.clone(), id.clone());
                tokio::spawn(async move { m.remove(&id).await.is_ok() })
            };
            let began = begin.await.unwrap();
            let removed = remove.await.unwrap();

            // exactly one side wins
            assert!(began != removed, "round {round}: began={began} removed={removed}");
            if removed {
                assert!(store.selection(&id).await.unwrap().is_none());
                assert!(store.status(&id).await.unwrap().is_none());
            } else {
                let current = store.status(&id).await.unwrap().unwrap();
                assert_eq!(current.state, AnalysisState::Analyzing);
                assert!(store.selection(&id).await.unwrap().is_some());
            }
        }
    }

    #[tokio::test]
    async fn interrupted_runs_are_settled_as_fail() {
        let (m, store) = machine().await;
        store.insert_selection(&selection("sel-2")).await.unwrap();
        let (owner, id) = ids();
        let other = SelectionId::new("sel-2");
        m.mark_pending(&owner, &id).await.unwrap();
        m.begin(&owner, &id).await.unwrap();
        m.mark_pending(&owner, &other).await.unwrap();

        let recovered = m.recover_interrupted().await.unwrap();
        assert_eq!(recovered, [id.clone()]);
        let current = m.current(&id).await.unwrap().unwrap();
        assert_eq!(current.state, AnalysisState::Fail);
        assert_eq!(current.reason.as_deref(), Some("interrupted before completion"));
        assert_eq!(
            m.current(&other).await.unwrap().unwrap().state,
            AnalysisState::Pending
        );

        // the selection can run again
        m.begin(&owner, &id).await.unwrap();
        assert_eq!(m.recover_interrupted().await.unwrap().len(), 1);
    }

    fn status(state: AnalysisState) -> AnalysisStatus {
        AnalysisStatus {
            selection_id: SelectionId::new("sel-1"),
            owner: OwnerId::new("alice"),
            state,
            reason: Some("internal detail".into()),
            updated_at: Utc::now(),
        }
    }

    fn finished(score: u32) -> AnalysisResult {
        let mut repo = PerRepositoryResult {
            repository_id: 1,
            full_name: "alice/api".into(),
            score,
            languages: BTreeMap::new(),
            language_quality: BTreeMap::new(),
            narrative: String::new(),
            commit_frequency: 1.0,
            activity: ActivitySnapshot::default(),
        };
        repo.language_quality.insert("java".into(), 85.0);
        repo.language_quality.insert("js".into(), -3.0);
        AnalysisResult {
            selection_id: SelectionId::new("sel-1"),
            owner: OwnerId::new("alice"),
            analyzed_at: Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap(),
            selected_repositories: vec!["api".into()],
            repositories: vec![repo],
            language_ratios: BTreeMap::new(),
            overall_score: score,
            activity: ActivityTotals::default(),
            primary_role: "Backend Developer".into(),
            role_score: 77,
            ai_analysis: AiNarrative::default(),
        }
    }

    #[test]
    fn pre_completion_states_only_show_message() {
        for state in [AnalysisState::Pending, AnalysisState::Analyzing, AnalysisState::Fail] {
            let view = project(&status(state), Some(&finished(90))).unwrap();
            assert_eq!(view.state(), state);
            let json = serde_json::to_value(&view).unwrap();
            let obj = json.as_object().unwrap();
            assert_eq!(obj.len(), 2);
            assert_eq!(obj["status"], state.as_label());
            assert_eq!(obj["message"], state.message());
            assert!(!json.to_string().contains("internal detail"));
        }
    }

    #[test]
    fn complete_projects_report_with_grade() {
        let view = project(&status(AnalysisState::Complete), Some(&finished(70))).unwrap();
        let StatusView::Complete(report) = view else {
            panic!("expected report");
        };
        assert_eq!(report.grade, Grade::B);
        assert_eq!(report.analysis_date, "2025-02-03 04:05:06");
        assert_eq!(report.language_levels["java"], 9);
        assert_eq!(report.language_levels["js"], 0);
        assert_eq!(report.primary_role, "Backend Developer");

        let json = serde_json::to_value(&*report).unwrap();
        assert_eq!(json["grade"], "B");
        assert_eq!(json["overallScore"], 70);
    }

    #[test]
    fn complete_without_result_is_not_found() {
        let err = project(&status(AnalysisState::Complete), None).unwrap_err();
        assert!(matches!(err, AnalysisError::NotFound { .. }));
    }
}
