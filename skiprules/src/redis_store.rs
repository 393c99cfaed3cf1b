use std::time::Duration;

use backoff::{exponential::ExponentialBackoff, SystemClock};
use redis::{Client, Commands};

use crate::rules::SkipRule;
use crate::store::{SkipRuleError, SkipRuleStore};

/// Redis hash holding the rule documents, field = rule name, value = JSON.
const RULES_KEY: &str = "foreman_skip_rules";

/// Redis-backed [`SkipRuleStore`] shared by every scheduler process.
#[derive(Debug, Clone)]
pub struct RedisRuleStore {
    client: Client,
    redis_url: String,
}

impl RedisRuleStore {
    pub fn open(redis_url: impl Into<String>) -> Result<Self, SkipRuleError> {
        let redis_url = redis_url.into();
        tracing::info!("RedisRuleStore.open: connecting to redis: {redis_url}");
        let client =
            Client::open(redis_url.clone()).map_err(|e| SkipRuleError::Transient(e.to_string()))?;
        Ok(Self { client, redis_url })
    }

    fn conn(&self) -> Result<redis::Connection, SkipRuleError> {
        let backoff: ExponentialBackoff<SystemClock> = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        backoff::retry(backoff, || {
            self.client.get_connection().map_err(|e| {
                tracing::error!(
                    "RedisRuleStore.conn: failed to connect to {}: {e:?}, retrying...",
                    self.redis_url
                );
                backoff::Error::Transient {
                    err: e,
                    retry_after: None,
                }
            })
        })
        .map_err(|e| match e {
            backoff::Error::Transient { err, .. } | backoff::Error::Permanent(err) => {
                SkipRuleError::Transient(err.to_string())
            }
        })
    }
}

#[async_trait::async_trait]
impl SkipRuleStore for RedisRuleStore {
    async fn create(&self, rule: SkipRule) -> Result<(), SkipRuleError> {
        tracing::info!("RedisRuleStore.create: {}", rule.name);
        let doc = serde_json::to_string(&rule)
            .map_err(|e| SkipRuleError::Validation(format!("unserializable rule: {e}")))?;
        let inserted: bool = self
            .conn()?
            .hset_nx(RULES_KEY, &rule.name, doc)
            .map_err(|e| SkipRuleError::Transient(e.to_string()))?;
        if !inserted {
            return Err(SkipRuleError::Duplicate(rule.name));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), SkipRuleError> {
        tracing::info!("RedisRuleStore.delete: {name}");
        let removed: usize = self
            .conn()?
            .hdel(RULES_KEY, name)
            .map_err(|e| SkipRuleError::Transient(e.to_string()))?;
        if removed == 0 {
            return Err(SkipRuleError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<SkipRule>, SkipRuleError> {
        let docs: Vec<(String, String)> = self
            .conn()?
            .hgetall(RULES_KEY)
            .map_err(|e| SkipRuleError::Transient(e.to_string()))?;
        let mut rules = Vec::with_capacity(docs.len());
        for (name, doc) in docs {
            match serde_json::from_str::<SkipRule>(&doc) {
                Ok(rule) => rules.push(rule),
                // A corrupt document must not take down replication; skip
                // it and keep serving the rest of the set.
                Err(e) => tracing::error!("RedisRuleStore.get_all: corrupt rule {name:?}: {e}"),
            }
        }
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rules)
    }
}
