use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use foreman_lib::{Error, Result};

use crate::types::{
    CompletionEvent, CompletionSender, ExecutorTaskStatus, Machine, TaskRequest, TaskResult,
};
use crate::Executor;

/// In-memory [`Executor`] used by the scenario tests.
///
/// Tests set up the machine pool, let the scheduler trigger tasks, then
/// drive them to completion with [`complete_task`](Self::complete_task),
/// which also publishes a [`CompletionEvent`] when a sender is attached.
/// Error injection covers the trigger path (transient and no-resource).
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    machines: Vec<Machine>,
    tasks: HashMap<String, TaskResult>,
    requests: HashMap<String, TaskRequest>,
    trigger_errors: VecDeque<Error>,
    next_id: u64,
    trigger_count: u64,
    completion_tx: Option<CompletionSender>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the machine pool.
    pub fn set_machines(&self, machines: Vec<Machine>) {
        self.state.lock().unwrap().machines = machines;
    }

    /// Publish completion events to `tx` from now on.
    pub fn attach_completion_sender(&self, tx: CompletionSender) {
        self.state.lock().unwrap().completion_tx = Some(tx);
    }

    /// Make the next trigger call fail with `error` (once).
    pub fn fail_next_trigger(&self, error: Error) {
        self.state.lock().unwrap().trigger_errors.push_back(error);
    }

    /// Number of trigger calls served, including failed ones.
    pub fn trigger_count(&self) -> u64 {
        self.state.lock().unwrap().trigger_count
    }

    /// All triggered tasks, in trigger order.
    pub fn triggered(&self) -> Vec<TaskResult> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<TaskResult> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// The original request behind an executor task.
    pub fn request_for(&self, executor_task_id: &str) -> Option<TaskRequest> {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(executor_task_id)
            .cloned()
    }

    /// Drive a triggered task to `status`, publishing a completion event
    /// when the status is terminal and a sender is attached. Publishing is
    /// at-least-once: calling this twice republishes.
    pub fn complete_task(&self, executor_task_id: &str, status: ExecutorTaskStatus, output: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(executor_task_id) else {
            panic!("no such executor task: {executor_task_id}");
        };
        task.status = status;
        if status == ExecutorTaskStatus::Running {
            task.started = Some(Utc::now());
        }
        if status.is_finished() {
            task.completed = Some(Utc::now());
            task.output = output.to_string();
        }
        let event = CompletionEvent {
            executor_task_id: executor_task_id.to_string(),
            userdata: task.userdata.clone(),
        };
        if status.is_finished() {
            if let Some(tx) = &state.completion_tx {
                tx.try_send(event).expect("completion channel full");
            }
        }
    }
}

#[async_trait::async_trait]
impl Executor for MockExecutor {
    async fn get_free_machines(&self, _pool: &str) -> Result<Vec<Machine>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .machines
            .iter()
            .filter(|m| m.is_free())
            .cloned()
            .collect())
    }

    async fn get_pending_tasks(&self, _pool: &str) -> Result<Vec<TaskResult>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == ExecutorTaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResult> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "executor task",
                id: task_id.to_string(),
            })
    }

    async fn get_task_completion_statuses(&self, task_ids: &[String]) -> Result<Vec<bool>> {
        let state = self.state.lock().unwrap();
        Ok(task_ids
            .iter()
            .map(|id| {
                state
                    .tasks
                    .get(id)
                    .map(|t| t.status.is_finished())
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn trigger_task(&self, request: &TaskRequest) -> Result<TaskResult> {
        let mut state = self.state.lock().unwrap();
        state.trigger_count += 1;
        if let Some(error) = state.trigger_errors.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        let id = format!("exec-{:04}", state.next_id);
        let result = TaskResult {
            id: id.clone(),
            status: ExecutorTaskStatus::Pending,
            userdata: request.userdata.clone(),
            created: Utc::now(),
            ..Default::default()
        };
        state.tasks.insert(id.clone(), result.clone());
        state.requests.insert(id, request.clone());
        Ok(result)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if !task.status.is_finished() {
                task.status = ExecutorTaskStatus::Canceled;
                task.completed = Some(Utc::now());
            }
        }
        Ok(())
    }
}
