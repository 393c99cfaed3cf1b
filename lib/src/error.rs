use serde::{Deserialize, Serialize};

/// The standardized result type used across the foreman crates.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy of the scheduler core.
///
/// The distinction that matters operationally is transient vs. permanent:
/// transient errors are retried with backoff and never cached, permanent
/// ones are cached (sticky) so the offending input is not retried.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The durable store misbehaved in a way a retry may fix.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// The execution service misbehaved in a way a retry may fix.
    #[error("transient executor error: {0}")]
    TransientExecutor(String),

    /// The task configuration of a RepoState is permanently unusable.
    #[error("permanent config error: {0}")]
    PermanentConfig(#[from] ConfigError),

    /// Optimistic-concurrency conflict: the stored record is newer than the
    /// caller's copy. Re-read and retry.
    #[error("concurrent update of {kind} {id}")]
    ConcurrentUpdate { kind: &'static str, id: String },

    /// The execution service reported that no machine can satisfy the
    /// dimensions of a triggered task.
    #[error("no machine satisfies dimensions {0:?}")]
    NoResource(Vec<String>),

    /// Rejected input; surfaced to the caller, never stored.
    #[error("validation error: {0}")]
    Validation(String),

    /// Record lookup miss where the record was required to exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore(_) | Error::TransientExecutor(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::PermanentConfig(_))
    }
}

/// Causes that make a RepoState's task configuration permanently unusable.
///
/// These are the sticky errors: once produced for a RepoState they are
/// written to the config cache's cold tier and replayed on every later
/// lookup, surviving process restarts.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum ConfigError {
    /// The pre-submit patch does not apply cleanly to its base revision.
    #[error("patch failed to merge: {0}")]
    MergeConflict(String),

    /// The tasks file is not valid JSON of the expected shape.
    #[error("invalid tasks file: {0}")]
    ParseFailed(String),

    /// The tasks file parsed but its graph is inconsistent (missing
    /// reference, dependency cycle, out-of-range field).
    #[error("invalid task config: {0}")]
    InvalidConfig(String),

    /// The tasks file does not exist at the given revision.
    #[error("tasks file missing: {0}")]
    FileMissing(String),
}

/// A cached permanent error, as persisted in the config cache.
///
/// Kept separate from [`ConfigError`] only to carry the time it was first
/// observed; replays compare equal regardless of when they happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredError {
    pub error: ConfigError,
    pub first_seen: chrono::DateTime<chrono::Utc>,
}

impl StoredError {
    pub fn new(error: ConfigError) -> Self {
        Self {
            error,
            first_seen: chrono::Utc::now(),
        }
    }
}

impl std::fmt::Display for StoredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (first seen {})", self.error, self.first_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_predicates() {
        assert!(Error::TransientStore("timeout".into()).is_transient());
        assert!(Error::TransientExecutor("503".into()).is_transient());
        assert!(!Error::Validation("bad name".into()).is_transient());
        assert!(Error::PermanentConfig(ConfigError::MergeConflict("x".into())).is_permanent());
    }

    #[test]
    fn config_error_round_trips_through_json() {
        let err = ConfigError::MergeConflict("conflict in infra/bots/tasks.json".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: ConfigError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
