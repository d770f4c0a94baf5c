//! Persisted selections, status rows and results.
//!
//! Key layout (shared by both backends, values are JSON):
//!
//! ```text
//! selection/{id}                      RepositorySelection
//! status/{id}                         AnalysisStatus (current row)
//! status_history/{id}/{seq}           AnalysisStatus (append-only)
//! result/{id}/{millis}/{seq}          AnalysisResult (append-only)
//! owner_events/{owner}                newest activity timestamp seen
//! ```
//!
//! Results are never overwritten; "latest" is the one with the greatest
//! analysis timestamp.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repolens_common::{AnalysisResult, AnalysisStatus, OwnerId, RepositorySelection, SelectionId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::Db;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AnalysisError, Result};

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn insert_selection(&self, selection: &RepositorySelection) -> Result<()>;
    async fn selection(&self, id: &SelectionId) -> Result<Option<RepositorySelection>>;
    /// Oldest first
    async fn selections_for_owner(&self, owner: &OwnerId) -> Result<Vec<RepositorySelection>>;
    /// Remove a selection together with its status, history and results.
    /// Returns whether the selection existed.
    async fn delete_selection(&self, id: &SelectionId) -> Result<bool>;

    async fn status(&self, id: &SelectionId) -> Result<Option<AnalysisStatus>>;
    /// Current row of every selection
    async fn statuses(&self) -> Result<Vec<AnalysisStatus>>;
    /// Replace the current row and append it to the history.
    async fn put_status(&self, status: &AnalysisStatus) -> Result<()>;
    /// Every status ever written, oldest first
    async fn status_history(&self, id: &SelectionId) -> Result<Vec<AnalysisStatus>>;

    /// Append a result and write `status` in one step; either both land or
    /// neither does.
    async fn commit_result(&self, result: &AnalysisResult, status: &AnalysisStatus) -> Result<()>;
    async fn latest_result(&self, id: &SelectionId) -> Result<Option<AnalysisResult>>;
    /// Oldest first
    async fn results(&self, id: &SelectionId) -> Result<Vec<AnalysisResult>>;

    async fn last_seen_event(&self, owner: &OwnerId) -> Result<Option<DateTime<Utc>>>;
    async fn record_seen_event(&self, owner: &OwnerId, at: DateTime<Utc>) -> Result<()>;
}

fn selection_key(id: &SelectionId) -> String {
    format!("selection/{id}")
}

fn status_key(id: &SelectionId) -> String {
    format!("status/{id}")
}

fn history_prefix(id: &SelectionId) -> String {
    format!("status_history/{id}/")
}

fn result_prefix(id: &SelectionId) -> String {
    format!("result/{id}/")
}

fn owner_events_key(owner: &OwnerId) -> String {
    format!("owner_events/{owner}")
}

// ─────────────────────────────────────────────────────────────────────────────
// sled
// ─────────────────────────────────────────────────────────────────────────────

/// Embedded on-disk store.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        debug!(path = %path.display(), "opened analysis store");
        Ok(Self { db })
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.db
            .scan_prefix(prefix)
            .values()
            .map(|v| Ok(serde_json::from_slice(&v?)?))
            .collect()
    }

    fn next_seq(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Durable flush, kept off the async worker threads.
    async fn flush(&self) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush())
            .await
            .map_err(|e| AnalysisError::Storage(format!("flush task failed: {e}")))??;
        Ok(())
    }

    /// Current row and history entry for `status`.
    fn stage_status(&self, batch: &mut sled::Batch, status: &AnalysisStatus) -> Result<()> {
        let value = to_json(status)?;
        let seq = self.next_seq()?;
        batch.insert(status_key(&status.selection_id).as_bytes(), value.clone());
        batch.insert(
            format!("{}{seq:020}", history_prefix(&status.selection_id)).as_bytes(),
            value,
        );
        Ok(())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

#[async_trait]
impl AnalysisStore for SledStore {
    async fn insert_selection(&self, selection: &RepositorySelection) -> Result<()> {
        self.db
            .insert(selection_key(&selection.id), to_json(selection)?)?;
        self.flush().await
    }

    async fn selection(&self, id: &SelectionId) -> Result<Option<RepositorySelection>> {
        self.get_json(&selection_key(id))
    }

    async fn selections_for_owner(&self, owner: &OwnerId) -> Result<Vec<RepositorySelection>> {
        let mut all: Vec<RepositorySelection> = self.scan_json("selection/")?;
        all.retain(|s| &s.owner == owner);
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }

    async fn delete_selection(&self, id: &SelectionId) -> Result<bool> {
        let existed = self.db.contains_key(selection_key(id))?;
        let mut batch = sled::Batch::default();
        batch.remove(selection_key(id).as_bytes());
        batch.remove(status_key(id).as_bytes());
        for prefix in [history_prefix(id), result_prefix(id)] {
            for key in self.db.scan_prefix(&prefix).keys() {
                batch.remove(key?);
            }
        }
        self.db.apply_batch(batch)?;
        self.flush().await?;
        Ok(existed)
    }

    async fn status(&self, id: &SelectionId) -> Result<Option<AnalysisStatus>> {
        self.get_json(&status_key(id))
    }

    async fn statuses(&self) -> Result<Vec<AnalysisStatus>> {
        self.scan_json("status/")
    }

    async fn put_status(&self, status: &AnalysisStatus) -> Result<()> {
        let mut batch = sled::Batch::default();
        self.stage_status(&mut batch, status)?;
        self.db.apply_batch(batch)?;
        self.flush().await
    }

    async fn status_history(&self, id: &SelectionId) -> Result<Vec<AnalysisStatus>> {
        self.scan_json(&history_prefix(id))
    }

    async fn commit_result(&self, result: &AnalysisResult, status: &AnalysisStatus) -> Result<()> {
        let millis = result.analyzed_at.timestamp_millis().max(0);
        let seq = self.next_seq()?;
        let key = format!("{}{millis:020}/{seq:020}", result_prefix(&result.selection_id));
        let mut batch = sled::Batch::default();
        batch.insert(key.as_bytes(), to_json(result)?);
        self.stage_status(&mut batch, status)?;
        self.db.apply_batch(batch)?;
        self.flush().await
    }

    async fn latest_result(&self, id: &SelectionId) -> Result<Option<AnalysisResult>> {
        // keys sort by timestamp, then insertion order
        match self.db.scan_prefix(result_prefix(id)).values().next_back() {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes?)?)),
            None => Ok(None),
        }
    }

    async fn results(&self, id: &SelectionId) -> Result<Vec<AnalysisResult>> {
        self.scan_json(&result_prefix(id))
    }

    async fn last_seen_event(&self, owner: &OwnerId) -> Result<Option<DateTime<Utc>>> {
        self.get_json(&owner_events_key(owner))
    }

    async fn record_seen_event(&self, owner: &OwnerId, at: DateTime<Utc>) -> Result<()> {
        self.db.insert(owner_events_key(owner), to_json(&at)?)?;
        self.flush().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    selections: HashMap<SelectionId, RepositorySelection>,
    statuses: HashMap<SelectionId, AnalysisStatus>,
    history: HashMap<SelectionId, Vec<AnalysisStatus>>,
    results: HashMap<SelectionId, Vec<AnalysisResult>>,
    owner_events: HashMap<OwnerId, DateTime<Utc>>,
}

impl MemoryInner {
    fn put_status(&mut self, status: &AnalysisStatus) {
        self.statuses
            .insert(status.selection_id.clone(), status.clone());
        self.history
            .entry(status.selection_id.clone())
            .or_default()
            .push(status.clone());
    }
}

/// Process-local store for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn insert_selection(&self, selection: &RepositorySelection) -> Result<()> {
        self.inner
            .lock()
            .await
            .selections
            .insert(selection.id.clone(), selection.clone());
        Ok(())
    }

    async fn selection(&self, id: &SelectionId) -> Result<Option<RepositorySelection>> {
        Ok(self.inner.lock().await.selections.get(id).cloned())
    }

    async fn selections_for_owner(&self, owner: &OwnerId) -> Result<Vec<RepositorySelection>> {
        let inner = self.inner.lock().await;
        let mut found: Vec<_> = inner
            .selections
            .values()
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn delete_selection(&self, id: &SelectionId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let existed = inner.selections.remove(id).is_some();
        inner.statuses.remove(id);
        inner.history.remove(id);
        inner.results.remove(id);
        Ok(existed)
    }

    async fn status(&self, id: &SelectionId) -> Result<Option<AnalysisStatus>> {
        Ok(self.inner.lock().await.statuses.get(id).cloned())
    }

    async fn statuses(&self) -> Result<Vec<AnalysisStatus>> {
        Ok(self.inner.lock().await.statuses.values().cloned().collect())
    }

    async fn put_status(&self, status: &AnalysisStatus) -> Result<()> {
        self.inner.lock().await.put_status(status);
        Ok(())
    }

    async fn status_history(&self, id: &SelectionId) -> Result<Vec<AnalysisStatus>> {
        Ok(self
            .inner
            .lock()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_result(&self, result: &AnalysisResult, status: &AnalysisStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entries = inner.results.entry(result.selection_id.clone()).or_default();
        entries.push(result.clone());
        // stable: equal timestamps keep insertion order
        entries.sort_by_key(|r| r.analyzed_at);
        inner.put_status(status);
        Ok(())
    }

    async fn latest_result(&self, id: &SelectionId) -> Result<Option<AnalysisResult>> {
        Ok(self
            .inner
            .lock()
            .await
            .results
            .get(id)
            .and_then(|r| r.last().cloned()))
    }

    async fn results(&self, id: &SelectionId) -> Result<Vec<AnalysisResult>> {
        Ok(self
            .inner
            .lock()
            .await
            .results
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn last_seen_event(&self, owner: &OwnerId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().await.owner_events.get(owner).copied())
    }

    async fn record_seen_event(&self, owner: &OwnerId, at: DateTime<Utc>) -> Result<()> {
        self.inner
            .lock()
            .await
            .owner_events
            .insert(owner.clone(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use repolens_common::{ActivityTotals, AiNarrative, AnalysisState};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap()
    }

    fn selection(id: &str, owner: &str, minute: u32) -> RepositorySelection {
        RepositorySelection {
            id: SelectionId::new(id),
            owner: OwnerId::new(owner),
            repositories: vec![],
            created_at: at(minute),
        }
    }

    fn status(id: &str, state: AnalysisState) -> AnalysisStatus {
        AnalysisStatus {
            selection_id: SelectionId::new(id),
            owner: OwnerId::new("alice"),
            state,
            reason: None,
            updated_at: Utc::now(),
        }
    }

    fn result(id: &str, when: DateTime<Utc>, score: u32) -> AnalysisResult {
        AnalysisResult {
            selection_id: SelectionId::new(id),
            owner: OwnerId::new("alice"),
            analyzed_at: when,
            selected_repositories: vec![],
            repositories: vec![],
            language_ratios: BTreeMap::new(),
            overall_score: score,
            activity: ActivityTotals::default(),
            primary_role: "Backend".into(),
            role_score: 70,
            ai_analysis: AiNarrative::default(),
        }
    }

    async fn exercise(store: &dyn AnalysisStore) {
        let s1 = SelectionId::new("s1");
        store.insert_selection(&selection("s1", "alice", 5)).await.unwrap();
        store.insert_selection(&selection("s0", "alice", 1)).await.unwrap();
        store.insert_selection(&selection("s2", "bob", 2)).await.unwrap();

        let mine = store.selections_for_owner(&OwnerId::new("alice")).await.unwrap();
        let ids: Vec<_> = mine.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["s0", "s1"]);

        store.put_status(&status("s1", AnalysisState::Pending)).await.unwrap();
        store.put_status(&status("s1", AnalysisState::Analyzing)).await.unwrap();
        store.put_status(&status("s1", AnalysisState::Fail)).await.unwrap();
        assert_eq!(
            store.status(&s1).await.unwrap().unwrap().state,
            AnalysisState::Fail
        );
        let history: Vec<_> = store
            .status_history(&s1)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(
            history,
            [AnalysisState::Pending, AnalysisState::Analyzing, AnalysisState::Fail]
        );

        let base = at(30);
        let later = base + Duration::minutes(5);
        for (when, score) in [(later, 2), (base, 1), (later, 3)] {
            store.put_status(&status("s1", AnalysisState::Analyzing)).await.unwrap();
            store
                .commit_result(&result("s1", when, score), &status("s1", AnalysisState::Complete))
                .await
                .unwrap();
        }
        let latest = store.latest_result(&s1).await.unwrap().unwrap();
        assert_eq!(latest.overall_score, 3);
        assert_eq!(store.results(&s1).await.unwrap().len(), 3);
        assert_eq!(store.results(&s1).await.unwrap()[0].overall_score, 1);
        // the completing status lands with each result
        assert_eq!(
            store.status(&s1).await.unwrap().unwrap().state,
            AnalysisState::Complete
        );
        assert_eq!(store.status_history(&s1).await.unwrap().len(), 9);

        store.put_status(&status("s0", AnalysisState::Analyzing)).await.unwrap();
        let mut current: Vec<_> = store
            .statuses()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.selection_id, s.state))
            .collect();
        current.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            current,
            [
                (SelectionId::new("s0"), AnalysisState::Analyzing),
                (SelectionId::new("s1"), AnalysisState::Complete),
            ]
        );

        let owner = OwnerId::new("alice");
        assert!(store.last_seen_event(&owner).await.unwrap().is_none());
        store.record_seen_event(&owner, base).await.unwrap();
        assert_eq!(store.last_seen_event(&owner).await.unwrap(), Some(base));

        assert!(store.delete_selection(&s1).await.unwrap());
        assert!(store.selection(&s1).await.unwrap().is_none());
        assert!(store.status(&s1).await.unwrap().is_none());
        assert!(store.status_history(&s1).await.unwrap().is_empty());
        assert!(store.results(&s1).await.unwrap().is_empty());
        assert!(store.latest_result(&s1).await.unwrap().is_none());
        assert!(!store.delete_selection(&s1).await.unwrap());

        // unrelated selections survive
        assert!(store.selection(&SelectionId::new("s2")).await.unwrap().is_some());
        assert_eq!(store.statuses().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sled_store_contract() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sled_writes_yield_to_other_tasks() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        for state in [AnalysisState::Pending, AnalysisState::Analyzing, AnalysisState::Fail] {
            store.put_status(&status("s1", state)).await.unwrap();
        }
        // single-threaded runtime: the ticker only runs if a write gave up the thread
        assert!(ticks.load(Ordering::SeqCst) > 0);
        ticker.abort();
        assert_eq!(store.status_history(&SelectionId::new("s1")).await.unwrap().len(), 3);
    }
}
