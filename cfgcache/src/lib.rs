//! # Foreman task-config cache
//!
//! Materializes the per-RepoState task configuration (read from the tasks
//! file in the repository, with any pre-submit patch applied) and memoizes
//! the result in two tiers:
//!
//! - a hot in-memory tier that coalesces concurrent misses so at most one
//!   materialization per RepoState is ever in flight;
//! - a cold durable tier holding positive entries and the *permanent*
//!   subset of negative entries, so a RepoState that can never produce a
//!   valid config (patch won't merge, file won't parse, graph is cyclic)
//!   is not retried, even across process restarts.
//!
//! Transient failures (network, store) are never cached.

mod cache;
mod sqlite_store;
mod store;

pub use cache::{CacheStats, CachedCfg, TasksCfgCache};
pub use sqlite_store::SqliteCfgStore;
pub use store::{CfgStore, CfgValue, MemCfgStore, StoredEntry};
