//! # Foreman task/job database
//!
//! Durable storage for [`Task`] and [`Job`] records plus the window-scoped
//! in-memory index the scheduler queries on every tick.
//!
//! ## Store
//!
//! [`RecordStore`] is the durable tier. Records are upserted with an
//! optimistic-concurrency discipline: every record carries a `db_modified`
//! stamp owned by the store, and an update fails with
//! `Error::ConcurrentUpdate` when the stored stamp is newer than the
//! caller's copy: a failed CAS, not a lock. The caller re-reads and
//! retries. IDs are assigned at insertion and sort chronologically.
//!
//! ## Cache
//!
//! [`TaskCache`] and [`JobCache`] sit on top of a store and maintain the
//! indexes the scheduler needs (by id, by RepoState, by blamed commit,
//! unfinished). All mutations are write-through: the store accepts the
//! record first, then the indexes are updated. On restart the caches
//! rebuild by streaming every record created inside the window.

mod cache;
mod mem_store;
mod sqlite_store;

pub use cache::{JobCache, TaskCache};
pub use mem_store::MemStore;
pub use sqlite_store::SqliteStore;

use chrono::{DateTime, Utc};
use foreman_lib::{Job, Result, Task};

/// The durable record store (component E).
///
/// Batch puts check and stamp each record independently; one conflicting
/// record fails the whole call without touching the rest, and the caller
/// is expected to re-read and retry.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update tasks. New records (empty `id`) receive an ID and
    /// `created` stamp; existing records must pass the CAS check. On
    /// return every record carries its stored `id` and `db_modified`.
    async fn put_tasks(&self, tasks: &mut [Task]) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// All tasks created at or after `start`, ordered by ID.
    async fn get_tasks_created_after(&self, start: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Insert or update jobs; semantics mirror [`put_tasks`](Self::put_tasks).
    async fn put_jobs(&self, jobs: &mut [Job]) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// All jobs created at or after `start`, ordered by ID.
    async fn get_jobs_created_after(&self, start: DateTime<Utc>) -> Result<Vec<Job>>;
}

// Shared CAS/stamping arithmetic for store implementations: the new stamp
// must be strictly newer than the stored one even within one millisecond.
pub(crate) fn next_stamp(stored: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match stored {
        Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_stamp_is_strictly_monotonic() {
        let t0 = Utc.timestamp_millis_opt(1000).unwrap();
        assert_eq!(next_stamp(None, t0), t0);
        assert_eq!(next_stamp(Some(t0), t0 + chrono::Duration::seconds(1)), t0 + chrono::Duration::seconds(1));
        // Same-millisecond update still advances.
        assert!(next_stamp(Some(t0), t0) > t0);
    }
}
