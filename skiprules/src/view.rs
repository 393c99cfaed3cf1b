use std::sync::{Arc, RwLock};
use std::time::Duration;

use foreman_repograph::RepoMap;
use tokio_util::sync::CancellationToken;

use crate::rules::{validate_rule, CompiledRule, SkipRule};
use crate::store::{SkipRuleError, SkipRuleStore};

/// The local, replicated view of the skip-rule set.
///
/// Matching runs against an immutable compiled snapshot behind a read
/// lock; [`SkipRules::update`] builds a fresh snapshot from the store and
/// swaps it in atomically, so concurrent readers see either the whole old
/// set or the whole new one, never a mix.
#[derive(Clone)]
pub struct SkipRules {
    store: Arc<dyn SkipRuleStore>,
    snapshot: Arc<RwLock<Arc<Vec<CompiledRule>>>>,
}

impl SkipRules {
    /// Build a view over `store`. The view is empty until the first
    /// [`update`](Self::update).
    pub fn new(store: Arc<dyn SkipRuleStore>) -> Self {
        Self {
            store,
            snapshot: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    /// Validate and persist a new rule, then refresh the local view.
    pub async fn add_rule(&self, rule: SkipRule, repos: &RepoMap) -> Result<(), SkipRuleError> {
        validate_rule(&rule, repos)?;
        self.store.create(rule).await?;
        self.update().await
    }

    /// Delete a rule by name, then refresh the local view.
    pub async fn delete_rule(&self, name: &str) -> Result<(), SkipRuleError> {
        self.store.delete(name).await?;
        self.update().await
    }

    /// One change-stream step: read the full rule set from the store,
    /// compile it, and install it atomically.
    pub async fn update(&self) -> Result<(), SkipRuleError> {
        let rules = self.store.get_all().await?;
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in &rules {
            match CompiledRule::compile(rule) {
                Ok(c) => compiled.push(c),
                // Keep replicating around a corrupt rule rather than
                // freezing the view on the last good snapshot.
                Err(e) => tracing::error!("skipping uncompilable rule: {e}"),
            }
        }
        *self.snapshot.write().unwrap() = Arc::new(compiled);
        Ok(())
    }

    /// Name of the first rule matching `(task_spec, commit)`, in rule-name
    /// order, or `None`.
    pub fn match_rule(&self, task_spec: &str, commit: &str) -> Option<String> {
        let snapshot = self.snapshot.read().unwrap().clone();
        snapshot
            .iter()
            .find(|rule| rule.matches(task_spec, commit))
            .map(|rule| rule.name.clone())
    }

    /// Number of rules in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the view coherent with the store until cancelled.
    pub async fn replicate(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("skip-rule replication stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.update().await {
                        tracing::warn!("skip-rule replication update failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRuleStore;
    use chrono::{TimeZone, Utc};
    use foreman_repograph::{Commit, RepoGraph};

    fn repos() -> RepoMap {
        let mut graph = RepoGraph::new("repo");
        for (i, hash) in ["a", "b", "c"].iter().enumerate() {
            graph.insert(Commit {
                hash: hash.to_string(),
                parents: if i == 0 {
                    vec![]
                } else {
                    vec![["a", "b", "c"][i - 1].to_string()]
                },
                author: "author@example.com".into(),
                subject: "s".into(),
                timestamp: Utc.timestamp_opt(3600 + 60 * i as i64, 0).unwrap(),
            });
        }
        let mut map = RepoMap::new();
        map.insert(graph);
        map
    }

    fn rule(name: &str, patterns: &[&str], commits: &[&str]) -> SkipRule {
        SkipRule {
            name: name.into(),
            added_by: "someone@example.com".into(),
            description: "test".into(),
            task_spec_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            commits: commits.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn created_rule_matches_after_one_update() {
        let view = SkipRules::new(Arc::new(InMemoryRuleStore::new()));
        let repos = repos();
        view.add_rule(rule("mask-build", &["^Build"], &["a", "b"]), &repos)
            .await
            .unwrap();

        // Every pair the rule covers reports the rule's name.
        for commit in ["a", "b"] {
            assert_eq!(
                view.match_rule("Build-Linux", commit),
                Some("mask-build".to_string())
            );
        }
        assert_eq!(view.match_rule("Build-Linux", "c"), None);
        assert_eq!(view.match_rule("Test-Linux", "a"), None);
    }

    #[tokio::test]
    async fn deleting_a_rule_unmasks_its_pairs() {
        let view = SkipRules::new(Arc::new(InMemoryRuleStore::new()));
        let repos = repos();
        view.add_rule(rule("r", &[], &["a"]), &repos).await.unwrap();
        assert!(view.match_rule("Anything", "a").is_some());

        view.delete_rule("r").await.unwrap();
        assert!(view.match_rule("Anything", "a").is_none());
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn first_match_is_in_name_order() {
        let view = SkipRules::new(Arc::new(InMemoryRuleStore::new()));
        let repos = repos();
        view.add_rule(rule("z-rule", &[], &["a"]), &repos).await.unwrap();
        view.add_rule(rule("a-rule", &[], &["a"]), &repos).await.unwrap();
        assert_eq!(view.match_rule("X", "a"), Some("a-rule".to_string()));
    }

    #[tokio::test]
    async fn invalid_rule_is_rejected_and_not_stored() {
        let store = Arc::new(InMemoryRuleStore::new());
        let view = SkipRules::new(store.clone());
        let err = view
            .add_rule(rule("bad", &["("], &[]), &repos())
            .await
            .unwrap_err();
        assert!(matches!(err, SkipRuleError::Validation(_)));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_sees_out_of_band_changes() {
        let store = Arc::new(InMemoryRuleStore::new());
        let view = SkipRules::new(store.clone());
        // Another process writes directly to the store.
        store.create(rule("other", &[], &["b"])).await.unwrap();
        assert!(view.match_rule("X", "b").is_none());
        view.update().await.unwrap();
        assert_eq!(view.match_rule("X", "b"), Some("other".to_string()));
    }
}
