use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::rules::SkipRule;

/// Errors from the skip-rule store.
#[derive(thiserror::Error, Debug)]
pub enum SkipRuleError {
    /// Rejected rule; surfaced to the caller, never stored.
    #[error("validation error: {0}")]
    Validation(String),

    /// A rule with the same name already exists.
    #[error("rule {0:?} already exists")]
    Duplicate(String),

    #[error("rule {0:?} not found")]
    NotFound(String),

    /// The backing store misbehaved; worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),
}

/// The shared document store holding the rule set.
///
/// Deliberately minimal: create, delete, read-everything. Change
/// propagation is the local view's job, which re-reads the full set and
/// installs it atomically.
#[async_trait::async_trait]
pub trait SkipRuleStore: Send + Sync {
    /// Persist a new rule. Fails with [`SkipRuleError::Duplicate`] when the
    /// name is taken.
    async fn create(&self, rule: SkipRule) -> Result<(), SkipRuleError>;

    /// Delete a rule by name.
    async fn delete(&self, name: &str) -> Result<(), SkipRuleError>;

    /// Read the full current rule set, sorted by name.
    async fn get_all(&self) -> Result<Vec<SkipRule>, SkipRuleError>;
}

/// In-memory [`SkipRuleStore`] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: Mutex<BTreeMap<String, SkipRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SkipRuleStore for InMemoryRuleStore {
    async fn create(&self, rule: SkipRule) -> Result<(), SkipRuleError> {
        let mut rules = self.rules.lock().unwrap();
        if rules.contains_key(&rule.name) {
            return Err(SkipRuleError::Duplicate(rule.name));
        }
        rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SkipRuleError> {
        match self.rules.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(SkipRuleError::NotFound(name.to_string())),
        }
    }

    async fn get_all(&self) -> Result<Vec<SkipRule>, SkipRuleError> {
        Ok(self.rules.lock().unwrap().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str) -> SkipRule {
        SkipRule {
            name: name.into(),
            added_by: "someone@example.com".into(),
            task_spec_patterns: vec![".*".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_delete_round_trip() {
        let store = InMemoryRuleStore::new();
        store.create(rule("b")).await.unwrap();
        store.create(rule("a")).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");

        assert!(matches!(
            store.create(rule("a")).await,
            Err(SkipRuleError::Duplicate(_))
        ));

        store.delete("a").await.unwrap();
        assert!(matches!(
            store.delete("a").await,
            Err(SkipRuleError::NotFound(_))
        ));
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }
}
