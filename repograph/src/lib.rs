//! # Foreman repo graph
//!
//! In-memory snapshots of the commit DAGs of the watched repositories, the
//! sliding window that bounds how much of each DAG the scheduler cares
//! about, and the capability used to read file content (optionally with a
//! pre-submit patch applied) out of a repository.
//!
//! The graph is a snapshot: it is updated wholesale when new commits are
//! observed and queried without further I/O. Only the [`RepoClient`]
//! touches the network.

mod client;
mod graph;
mod window;

pub use client::{HttpRepoClient, InMemoryRepoClient, RepoClient, RepoError, TASKS_CFG_FILE};
pub use graph::{Commit, RepoGraph, RepoMap};
pub use window::Window;
