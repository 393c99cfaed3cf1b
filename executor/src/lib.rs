//! # Foreman execution client
//!
//! The opaque capability the scheduler uses to talk to the external
//! execution service: list idle machines, trigger tasks, poll results, and
//! receive completion notifications. The scheduler holds the capability as
//! `Arc<dyn Executor>` and never branches on the concrete implementation;
//! [`HttpExecutor`] is the production client, [`MockExecutor`] drives the
//! scenario tests.

mod http;
mod mock;
mod types;

pub use http::HttpExecutor;
pub use mock::MockExecutor;
pub use types::{
    completion_channel, CompletionEvent, CompletionReceiver, CompletionSender, ExecutorTaskStatus,
    Machine, TaskRequest, TaskResult,
};

use foreman_lib::Result;

/// Capability set of the execution service.
///
/// Every call may suspend (network) and must respect the ambient
/// cancellation context of its caller.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Idle, non-quarantined, non-dead machines in `pool`.
    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>>;

    /// Tasks dispatched to `pool` and not yet picked up by a machine.
    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>>;

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResult>;

    /// Batch finished-predicate: one bool per requested ID, in order.
    async fn get_task_completion_statuses(&self, task_ids: &[String]) -> Result<Vec<bool>>;

    /// Enqueue a task. A `no-resource` response is reported as a hard
    /// [`foreman_lib::Error::NoResource`] rather than a result.
    async fn trigger_task(&self, request: &TaskRequest) -> Result<TaskResult>;

    /// Kill a previously triggered task. Idempotent.
    async fn cancel_task(&self, task_id: &str) -> Result<()>;
}
