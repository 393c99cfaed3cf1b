//! # Foreman core library
//!
//! Shared data model of the foreman scheduler: the identity of a checkout
//! ([`RepoState`]), the declarative task graph loaded from a repository
//! ([`TasksCfg`]), the records the scheduler tracks ([`Task`], [`Job`]),
//! sortable record IDs, and the error taxonomy every component speaks.
//!
//! The scheduler never executes anything itself; it decides *what* should
//! run *where*, hands the work to an external execution service, and keeps
//! a durable account of the outcome. The types here are therefore plain
//! data: cheap to clone, serde-serializable, and free of I/O.

pub mod error;
pub mod id;
pub mod job;
pub mod repostate;
pub mod task;
pub mod tasks_cfg;

pub use error::{ConfigError, Error, Result, StoredError};
pub use id::{IdGenerator, RecordId};
pub use job::{Job, JobStatus, RetryBudgets};
pub use repostate::{Patch, RepoState};
pub use task::{Task, TaskStatus};
pub use tasks_cfg::{CasSpec, CipdPackage, JobSpec, TaskSpec, TasksCfg};

/// Returns `Ok(())`, or a [`Error::Validation`] carrying `message` when the
/// condition does not hold.
pub fn ensure(condition: bool, message: &str) -> Result<()> {
    if !condition {
        return Err(Error::Validation(message.to_string()));
    }
    Ok(())
}
