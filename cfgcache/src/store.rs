use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreman_lib::{RepoState, Result, StoredError, TasksCfg};
use serde::{Deserialize, Serialize};

/// A cached materialization result: either a valid config or a sticky
/// permanent error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfgValue {
    Cfg(TasksCfg),
    Error(StoredError),
}

/// One cold-tier entry. `commit_ts` is the timestamp of the RepoState's
/// primary-chain commit and drives age-based cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub repo_state: RepoState,
    pub value: CfgValue,
    pub commit_ts: DateTime<Utc>,
}

/// The durable cold tier of the config cache, keyed by
/// `(repo, revision, patch)`.
#[async_trait::async_trait]
pub trait CfgStore: Send + Sync {
    async fn get(&self, repo_state: &RepoState) -> Result<Option<StoredEntry>>;

    async fn put(&self, entry: StoredEntry) -> Result<()>;

    /// Remove every entry whose commit timestamp is older than `cutoff`.
    /// Returns the number of entries removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// In-memory [`CfgStore`]; a cold tier that is not actually durable, for
/// tests and throwaway deployments.
#[derive(Debug, Default)]
pub struct MemCfgStore {
    entries: Mutex<HashMap<RepoState, StoredEntry>>,
}

impl MemCfgStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CfgStore for MemCfgStore {
    async fn get(&self, repo_state: &RepoState) -> Result<Option<StoredEntry>> {
        Ok(self.entries.lock().unwrap().get(repo_state).cloned())
    }

    async fn put(&self, entry: StoredEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.repo_state.clone(), entry);
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.commit_ts >= cutoff);
        Ok(before - entries.len())
    }
}

// Key used by sqlite and other keyed stores: the patch collapses to a
// stable string so the whole RepoState fits in a composite primary key.
pub(crate) fn patch_key(repo_state: &RepoState) -> String {
    match &repo_state.patch {
        None => String::new(),
        Some(p) => format!("{}/{}/{}", p.code_review, p.change_id, p.patchset_id),
    }
}
