use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use foreman_lib::{TaskSpec, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// An execution machine as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Machine {
    pub id: String,
    /// `"key:value"` capabilities.
    pub dimensions: Vec<String>,
    pub is_dead: bool,
    pub is_quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            id: String::new(),
            dimensions: Vec::new(),
            is_dead: false,
            is_quarantined: false,
            current_task_id: None,
        }
    }
}

impl Machine {
    pub fn new(id: impl Into<String>, dimensions: &[&str]) -> Self {
        Self {
            id: id.into(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Whether this machine satisfies every dimension constraint.
    pub fn can_run(&self, dimensions: &[String]) -> bool {
        let have: HashSet<&str> = self.dimensions.iter().map(String::as_str).collect();
        dimensions.iter().all(|d| have.contains(d.as_str()))
    }

    /// Idle and healthy.
    pub fn is_free(&self) -> bool {
        !self.is_dead && !self.is_quarantined && self.current_task_id.is_none()
    }
}

/// Wire status of an executor-side task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorTaskStatus {
    Pending,
    Running,
    /// The command ran and exited cleanly.
    Completed,
    /// The command ran and exited with an error.
    Failed,
    /// Infrastructure error: the machine died or the setup failed.
    Mishap,
    /// No machine in the pool can ever satisfy the request's dimensions.
    NoResource,
    Canceled,
    /// The request expired before any machine picked it up.
    Expired,
}

impl ExecutorTaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutorTaskStatus::Pending | ExecutorTaskStatus::Running)
    }

    /// Map the wire status onto the scheduler's task status. `NoResource`
    /// has no mapping; it is surfaced as a hard error at trigger time.
    pub fn to_task_status(self) -> TaskStatus {
        match self {
            ExecutorTaskStatus::Pending => TaskStatus::Pending,
            ExecutorTaskStatus::Running => TaskStatus::Running,
            ExecutorTaskStatus::Completed => TaskStatus::Success,
            ExecutorTaskStatus::Failed => TaskStatus::Failure,
            ExecutorTaskStatus::Mishap | ExecutorTaskStatus::NoResource | ExecutorTaskStatus::Expired => {
                TaskStatus::Mishap
            }
            ExecutorTaskStatus::Canceled => TaskStatus::Canceled,
        }
    }
}

/// A request to enqueue one task on the execution service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRequest {
    pub name: String,
    pub pool: String,
    pub dimensions: Vec<String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub cas_input: String,
    pub cipd_packages: Vec<foreman_lib::CipdPackage>,
    pub priority: f64,
    pub expiration_ns: u64,
    pub execution_timeout_ns: u64,
    pub io_timeout_ns: u64,
    pub idempotent: bool,
    pub outputs: Vec<String>,
    pub service_account: String,
    /// Opaque payload echoed back in completion notifications; the
    /// scheduler stores its internal task ID here.
    pub userdata: String,
}

impl TaskRequest {
    /// Build a request from a task spec. The caller fills `cas_input` and
    /// `userdata`.
    pub fn from_spec(name: &str, pool: &str, spec: &TaskSpec) -> Self {
        Self {
            name: name.to_string(),
            pool: pool.to_string(),
            dimensions: spec.dimensions.clone(),
            command: spec.command.clone(),
            env: spec.env.clone(),
            env_prefixes: spec.env_prefixes.clone(),
            cas_input: String::new(),
            cipd_packages: spec.cipd_packages.clone(),
            priority: spec.priority,
            expiration_ns: spec.expiration_ns,
            execution_timeout_ns: spec.execution_timeout_ns,
            io_timeout_ns: spec.io_timeout_ns,
            idempotent: spec.idempotent,
            outputs: spec.outputs.clone(),
            service_account: spec.service_account.clone(),
            userdata: String::new(),
        }
    }
}

/// The executor's view of a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskResult {
    pub id: String,
    pub status: ExecutorTaskStatus,
    pub machine_id: String,
    /// CAS digest of the output tree, once finished.
    pub output: String,
    pub userdata: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

impl Default for TaskResult {
    fn default() -> Self {
        Self {
            id: String::new(),
            status: ExecutorTaskStatus::Pending,
            machine_id: String::new(),
            output: String::new(),
            userdata: String::new(),
            created: DateTime::<Utc>::MIN_UTC,
            started: None,
            completed: None,
        }
    }
}

/// Completion notification published by the executor. Delivery is
/// at-least-once; handlers must be idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    /// The executor-side task ID; `taskId` on the wire.
    #[serde(alias = "taskId")]
    pub executor_task_id: String,
    /// The scheduler task ID captured at trigger time.
    pub userdata: String,
}

pub type CompletionSender = mpsc::Sender<CompletionEvent>;
pub type CompletionReceiver = mpsc::Receiver<CompletionEvent>;

/// The pub/sub channel completion events arrive on.
pub fn completion_channel(buffer: usize) -> (CompletionSender, CompletionReceiver) {
    mpsc::channel(buffer)
}
