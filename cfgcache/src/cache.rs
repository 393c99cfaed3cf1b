use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use foreman_lib::{ConfigError, RepoState, Result, StoredError, TasksCfg};
use foreman_repograph::{RepoClient, RepoError, TASKS_CFG_FILE};
use tokio::sync::{Mutex, OnceCell};

/// What a lookup resolves to once materialization settles: a config, or a
/// sticky permanent error replayed on every later lookup.
pub type CachedCfg = std::result::Result<Arc<TasksCfg>, StoredError>;

use crate::store::{CfgStore, CfgValue, StoredEntry};

type Cell = Arc<OnceCell<CachedCfg>>;

/// Monotonic lookup counters. A hit is a lookup served from either tier
/// without materializing; a miss materialized from the repository. The
/// scheduler's metrics scrape these and export the deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// The task-configuration cache.
///
/// Lookup order: hot tier, cold tier, materialization from the repository.
/// The hot tier keys one [`OnceCell`] per RepoState, which gives the
/// at-most-one-in-flight guarantee: a second concurrent `get` for the same
/// RepoState awaits the first materialization and observes its result.
/// A failed (transient) materialization leaves the cell empty, so the next
/// lookup retries; permanent outcomes initialize the cell forever.
pub struct TasksCfgCache {
    repo_client: Arc<dyn RepoClient>,
    cold: Arc<dyn CfgStore>,
    hot: Mutex<HashMap<RepoState, (DateTime<Utc>, Cell)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TasksCfgCache {
    pub fn new(repo_client: Arc<dyn RepoClient>, cold: Arc<dyn CfgStore>) -> Self {
        Self {
            repo_client,
            cold,
            hot: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Lookup counters since construction.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Return the config governing `repo_state`, or its sticky error.
    ///
    /// `commit_ts` is the timestamp of the RepoState's primary-chain
    /// commit; it is recorded for age-based cleanup. The outer `Result`
    /// carries transient errors only, which are never cached.
    pub async fn get(&self, repo_state: &RepoState, commit_ts: DateTime<Utc>) -> Result<CachedCfg> {
        let cell = {
            let mut hot = self.hot.lock().await;
            let (_, cell) = hot
                .entry(repo_state.clone())
                .or_insert_with(|| (commit_ts, Arc::new(OnceCell::new())));
            cell.clone()
        };
        if cell.initialized() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        let value = cell
            .get_or_try_init(|| self.load(repo_state, commit_ts))
            .await?;
        Ok(value.clone())
    }

    /// Upsert an entry, bypassing materialization. Used by tests and by
    /// operators repairing a poisoned entry.
    pub async fn set(
        &self,
        repo_state: &RepoState,
        value: CachedCfg,
        commit_ts: DateTime<Utc>,
    ) -> Result<()> {
        let stored_value = match &value {
            Ok(cfg) => CfgValue::Cfg((**cfg).clone()),
            Err(e) => CfgValue::Error(e.clone()),
        };
        self.cold
            .put(StoredEntry {
                repo_state: repo_state.clone(),
                value: stored_value,
                commit_ts,
            })
            .await?;
        let cell = OnceCell::new();
        cell.set(value).ok();
        self.hot
            .lock()
            .await
            .insert(repo_state.clone(), (commit_ts, Arc::new(cell)));
        Ok(())
    }

    /// Evict every entry whose commit is older than `age`, from both tiers.
    pub async fn cleanup(&self, age: Duration) -> Result<()> {
        let cutoff = Utc::now() - age;
        let removed = self.cold.delete_older_than(cutoff).await?;
        let mut hot = self.hot.lock().await;
        let before = hot.len();
        hot.retain(|_, (commit_ts, _)| *commit_ts >= cutoff);
        tracing::debug!(
            "config cache cleanup: dropped {} hot / {removed} cold entries",
            before - hot.len()
        );
        Ok(())
    }

    /// Number of settled or in-flight hot entries.
    pub async fn len(&self) -> usize {
        self.hot.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // Cold-tier lookup, then materialization. Ok(..) outcomes are final
    // (including permanent errors); Err(..) is transient and not cached.
    async fn load(&self, repo_state: &RepoState, commit_ts: DateTime<Utc>) -> Result<CachedCfg> {
        if let Some(entry) = self.cold.get(repo_state).await? {
            tracing::debug!("config cache cold hit for {repo_state}");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(match entry.value {
                CfgValue::Cfg(cfg) => Ok(Arc::new(cfg)),
                CfgValue::Error(e) => Err(e),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let outcome = self.materialize(repo_state).await?;
        let stored_value = match &outcome {
            Ok(cfg) => CfgValue::Cfg((**cfg).clone()),
            Err(e) => CfgValue::Error(e.clone()),
        };
        self.cold
            .put(StoredEntry {
                repo_state: repo_state.clone(),
                value: stored_value,
                commit_ts,
            })
            .await?;
        match &outcome {
            Ok(_) => tracing::info!("materialized task config for {repo_state}"),
            Err(e) => tracing::warn!("permanent config error for {repo_state}: {e}"),
        }
        Ok(outcome)
    }

    async fn materialize(&self, repo_state: &RepoState) -> Result<CachedCfg> {
        let read = match &repo_state.patch {
            Some(patch) => {
                self.repo_client
                    .apply_patch_and_read(
                        &repo_state.repo,
                        &repo_state.revision,
                        patch,
                        TASKS_CFG_FILE,
                    )
                    .await
            }
            None => {
                self.repo_client
                    .read_file(&repo_state.repo, &repo_state.revision, TASKS_CFG_FILE)
                    .await
            }
        };
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(RepoError::MergeConflict(msg)) => {
                return Ok(Err(StoredError::new(ConfigError::MergeConflict(msg))));
            }
            Err(e @ RepoError::FileMissing { .. }) => {
                return Ok(Err(StoredError::new(ConfigError::FileMissing(
                    e.to_string(),
                ))));
            }
            Err(e) => {
                return Err(foreman_lib::Error::TransientStore(format!(
                    "reading tasks file for {repo_state}: {e}"
                )));
            }
        };
        match TasksCfg::from_json(&bytes) {
            Ok(cfg) => Ok(Ok(Arc::new(cfg))),
            Err(e) => Ok(Err(StoredError::new(e))),
        }
    }
}
