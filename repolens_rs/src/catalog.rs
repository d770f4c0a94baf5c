//! Source-control host: repository listings, activity counters and the
//! owner's public event stream.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repolens_common::{ActivitySnapshot, OwnerId, RepositoryDescriptor};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use tracing::debug;

use crate::config::GithubConfig;
use crate::error::{AnalysisError, Result};

const PER_PAGE: usize = 100;

/// Event kinds that count as fresh activity.
pub const ACTIVITY_EVENT_KINDS: [&str; 3] = ["PushEvent", "IssuesEvent", "PullRequestEvent"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Raw activity of one repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryActivity {
    pub commit_dates: Vec<DateTime<Utc>>,
    pub pull_requests: u64,
    pub issues: u64,
}

impl RepositoryActivity {
    pub fn snapshot(&self, stars: u64) -> ActivitySnapshot {
        ActivitySnapshot {
            stars,
            commits: self.commit_dates.len() as u64,
            pull_requests: self.pull_requests,
            issues: self.issues,
        }
    }
}

#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn repositories(&self, owner: &OwnerId) -> Result<Vec<RepositoryDescriptor>>;
    async fn activity(&self, repository: &RepositoryDescriptor) -> Result<RepositoryActivity>;
    /// Most recent public events of the owner, newest first
    async fn recent_events(&self, owner: &OwnerId) -> Result<Vec<ActivityEvent>>;
}

/// Whether the owner has done anything worth a new analysis.
///
/// With no events at all, a run is allowed only if nothing was ever recorded
/// or the last recorded activity is older than the freshness window.
/// Otherwise any push, issue or pull-request event qualifies.
pub fn has_new_activity(
    events: &[ActivityEvent],
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_days: i64,
) -> bool {
    if events.is_empty() {
        return match last_seen {
            None => true,
            Some(at) => at < now - chrono::Duration::days(window_days),
        };
    }
    events
        .iter()
        .any(|e| ACTIVITY_EVENT_KINDS.contains(&e.kind.as_str()))
}

#[derive(Deserialize)]
struct CommitItem {
    commit: CommitBody,
}

#[derive(Deserialize)]
struct CommitBody {
    author: Option<CommitSignature>,
    committer: Option<CommitSignature>,
}

#[derive(Deserialize)]
struct CommitSignature {
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct IssueItem {
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

/// GitHub REST v3 catalog.
#[derive(Debug, Clone)]
pub struct GithubCatalog {
    http: Client,
    api_url: String,
    token: Option<String>,
    max_pages: u32,
}

impl GithubCatalog {
    pub fn new(config: &GithubConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("repolens"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            max_pages: config.max_pages.max(1),
        })
    }

    /// Fetch every page of a listing. `Ok(None)` when the host answers 404/409.
    async fn paged<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<Vec<T>>> {
        let mut items = Vec::new();
        for page in 1..=self.max_pages {
            let mut req = self
                .http
                .get(format!("{}/{}", self.api_url, path))
                .query(query)
                .query(&[("per_page", PER_PAGE as u32), ("page", page)]);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await?;
            // 409: empty repository has no commits
            if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::CONFLICT) {
                return Ok(if page == 1 { None } else { Some(items) });
            }
            let batch: Vec<T> = resp.error_for_status()?.json().await.map_err(|e| {
                AnalysisError::Parsing(format!("source host listing {path}: {e}"))
            })?;
            let n = batch.len();
            items.extend(batch);
            if n < PER_PAGE {
                break;
            }
        }
        debug!(path = %path, items = items.len(), "fetched listing");
        Ok(Some(items))
    }
}

#[async_trait]
impl SourceCatalog for GithubCatalog {
    async fn repositories(&self, owner: &OwnerId) -> Result<Vec<RepositoryDescriptor>> {
        self.paged(&format!("users/{owner}/repos"), &[("sort", "updated")])
            .await?
            .ok_or_else(|| AnalysisError::not_found("owner", owner))
    }

    async fn activity(&self, repository: &RepositoryDescriptor) -> Result<RepositoryActivity> {
        let full = &repository.full_name;
        let commits: Vec<CommitItem> = self
            .paged(&format!("repos/{full}/commits"), &[])
            .await?
            .unwrap_or_default();
        let pulls: Vec<IgnoredAny> = self
            .paged(&format!("repos/{full}/pulls"), &[("state", "all")])
            .await?
            .unwrap_or_default();
        let issues: Vec<IssueItem> = self
            .paged(&format!("repos/{full}/issues"), &[("state", "all")])
            .await?
            .unwrap_or_default();

        let commit_dates = commits
            .into_iter()
            .filter_map(|c| {
                c.commit
                    .author
                    .and_then(|a| a.date)
                    .or_else(|| c.commit.committer.and_then(|s| s.date))
            })
            .collect();
        Ok(RepositoryActivity {
            commit_dates,
            pull_requests: pulls.len() as u64,
            // the issues listing also returns pull requests
            issues: issues.iter().filter(|i| i.pull_request.is_none()).count() as u64,
        })
    }

    async fn recent_events(&self, owner: &OwnerId) -> Result<Vec<ActivityEvent>> {
        Ok(self
            .paged(&format!("users/{owner}/events"), &[])
            .await?
            .unwrap_or_default())
    }
}
