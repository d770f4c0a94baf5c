//! Local working copies of remote repositories.
//!
//! A working copy lives at `{root}/{project_key}` and is reused across runs.
//! Clones land in a hidden staging directory next to it and are renamed into
//! place only once complete, so an interrupted clone never shows up as a
//! working copy. An existing directory is reused only if its HEAD resolves
//! to a commit; anything else is discarded and cloned again.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::{Oid, Repository};
use repolens_common::RepositoryDescriptor;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MirrorConfig;
use crate::error::{AnalysisError, Result};

/// Deterministic project key (`owner_repo`) for a repository full name.
///
/// Anything outside `[A-Za-z0-9_.-]` becomes `_`, so the key is safe both as
/// a directory name and as a quality-gate project key.
pub fn project_key(full_name: &str) -> String {
    full_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SourceMirror {
    root: PathBuf,
    clone_base_url: String,
}

impl SourceMirror {
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            root: config.root.clone(),
            clone_base_url: config.clone_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn clone_url(&self, repository: &RepositoryDescriptor) -> String {
        format!("{}/{}.git", self.clone_base_url, repository.full_name)
    }

    pub fn workdir(&self, repository: &RepositoryDescriptor) -> PathBuf {
        self.root.join(project_key(&repository.full_name))
    }

    /// Make sure a usable working copy exists and return its path.
    pub async fn ensure(&self, repository: &RepositoryDescriptor) -> Result<PathBuf> {
        let target = self.workdir(repository);
        let staging = self.root.join(format!(
            ".{}.partial-{}",
            project_key(&repository.full_name),
            Uuid::new_v4().simple()
        ));
        let url = self.clone_url(repository);
        let name = repository.full_name.clone();

        let dest = target.clone();
        tokio::task::spawn_blocking(move || materialize(&name, &url, &dest, &staging))
            .await
            .map_err(|e| AnalysisError::AnalysisFailure(format!("clone task aborted: {e}")))??;
        Ok(target)
    }
}

/// Commit HEAD points at, if `path` holds a readable repository.
fn head_commit(path: &Path) -> std::result::Result<Oid, git2::Error> {
    let repo = Repository::open(path)?;
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id())
}

fn materialize(name: &str, url: &str, target: &Path, staging: &Path) -> Result<()> {
    if target.exists() {
        match head_commit(target) {
            Ok(head) => {
                debug!(repo = %name, path = %target.display(), %head, "working copy present, skipping clone");
                return Ok(());
            }
            Err(e) => {
                warn!(repo = %name, path = %target.display(), error = %e, "discarding unusable working copy");
                fs::remove_dir_all(target)?;
            }
        }
    }

    info!(repo = %name, path = %target.display(), "cloning repository");
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = Repository::clone(url, staging) {
        let _ = fs::remove_dir_all(staging);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(staging, target) {
        let _ = fs::remove_dir_all(staging);
        // another clone of the same repository finished first
        if head_commit(target).is_ok() {
            return Ok(());
        }
        return Err(e.into());
    }
    Ok(())
}

/// Per-project-key async locks so one working copy has one writer at a time.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting while another run holds it.
    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
