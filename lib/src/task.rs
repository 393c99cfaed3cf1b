use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::RecordId;
use crate::repostate::RepoState;

/// Lifecycle status of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and handed to the executor, not yet picked up by a machine.
    Pending,
    /// Picked up by a machine.
    Running,
    /// Terminal: the command exited cleanly.
    Success,
    /// Terminal: the command exited with an error.
    Failure,
    /// Terminal: infrastructure error, not the task's fault.
    Mishap,
    /// Terminal: forcibly canceled.
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

// Numeric codes for the durable store. Failures are negative by convention;
// gaps leave room for new codes.
impl From<TaskStatus> for i32 {
    fn from(status: TaskStatus) -> i32 {
        match status {
            TaskStatus::Success => 0,
            TaskStatus::Pending => 1000,
            TaskStatus::Running => 2000,
            TaskStatus::Failure => -1000,
            TaskStatus::Mishap => -2000,
            TaskStatus::Canceled => -3000,
        }
    }
}

impl From<i32> for TaskStatus {
    fn from(value: i32) -> TaskStatus {
        match value {
            0 => TaskStatus::Success,
            1000 => TaskStatus::Pending,
            2000 => TaskStatus::Running,
            -1000 => TaskStatus::Failure,
            -2000 => TaskStatus::Mishap,
            _ => TaskStatus::Canceled,
        }
    }
}

/// One attempt to run a task spec at a RepoState.
///
/// Immutable once terminal, except for `properties` updates from external
/// metadata. The blame list (`commits`) is the contiguous first-parent
/// chain this attempt's result speaks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: RecordId,
    pub repo_state: RepoState,
    /// Name of the task spec this attempt runs.
    pub name: String,
    pub status: TaskStatus,
    /// 0-based attempt counter for retry accounting.
    pub attempt: u32,
    /// Commits this attempt blames for, newest first, starting at the
    /// RepoState's revision.
    pub commits: Vec<String>,
    /// IDs of the dependency tasks whose outputs this attempt consumed.
    pub parent_task_ids: Vec<RecordId>,
    /// Task handle on the executor side, once triggered.
    pub executor_task_id: String,
    /// Machine the executor assigned, once known.
    pub machine_id: String,
    /// CAS digest of the task's output tree, once finished.
    pub output: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Optimistic-concurrency stamp owned by the store. Zero value for
    /// records never written.
    pub db_modified: DateTime<Utc>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            repo_state: RepoState::new("", ""),
            name: String::new(),
            status: TaskStatus::Pending,
            attempt: 0,
            commits: Vec::new(),
            parent_task_ids: Vec::new(),
            executor_task_id: String::new(),
            machine_id: String::new(),
            output: String::new(),
            created: DateTime::<Utc>::MIN_UTC,
            started: None,
            finished: None,
            db_modified: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl Task {
    pub fn new(repo_state: RepoState, name: impl Into<String>) -> Self {
        Self {
            repo_state,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Identity under the non-duplication invariant: at most one
    /// non-terminal task may exist per key at any time.
    pub fn key(&self) -> (RepoState, String) {
        (self.repo_state.clone(), self.name.clone())
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} @ {} [{:?}]",
            self.id, self.name, self.repo_state, self.status
        )
    }
}
