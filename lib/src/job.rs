use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::RecordId;
use crate::repostate::RepoState;
use crate::task::{Task, TaskStatus};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Explicitly requested, not yet picked up by a scheduling tick.
    Requested,
    InProgress,
    /// Terminal: every task spec the job names has a successful attempt.
    Success,
    /// Terminal: some task spec exhausted its retries on a failure.
    Failure,
    /// Terminal: some task spec exhausted its retries on a mishap.
    Mishap,
    /// Terminal: canceled before completion.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Requested | JobStatus::InProgress)
    }
}

/// How many times a task spec is re-attempted per terminal non-success
/// status before its job gives up on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryBudgets {
    /// Total attempts allowed when the latest terminal status is `failure`.
    pub failure_attempts: u32,
    /// Total attempts allowed when the latest terminal status is `mishap`.
    pub mishap_attempts: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            failure_attempts: 2,
            mishap_attempts: 2,
        }
    }
}

/// One requested realization of a job spec at a RepoState.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    pub id: RecordId,
    pub repo_state: RepoState,
    /// Name of the job spec.
    pub name: String,
    pub status: JobStatus,
    pub priority: f64,
    /// Task specs the job requires, as read from its job spec.
    pub task_specs: Vec<String>,
    /// IDs of the tasks that fulfilled (or are fulfilling) this job,
    /// keyed by task spec name.
    pub tasks: BTreeMap<String, Vec<RecordId>>,
    /// True when the job was explicitly requested rather than derived from
    /// a new commit; forced jobs boost their candidates' scores.
    pub is_force: bool,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Optimistic-concurrency stamp owned by the store.
    pub db_modified: DateTime<Utc>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: String::new(),
            repo_state: RepoState::new("", ""),
            name: String::new(),
            status: JobStatus::Requested,
            priority: 0.5,
            task_specs: Vec::new(),
            tasks: BTreeMap::new(),
            is_force: false,
            created: DateTime::<Utc>::MIN_UTC,
            finished: None,
            db_modified: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl Job {
    pub fn new(repo_state: RepoState, name: impl Into<String>, task_specs: Vec<String>) -> Self {
        Self {
            repo_state,
            name: name.into(),
            task_specs,
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} @ {} [{:?}]",
            self.id, self.name, self.repo_state, self.status
        )
    }
}

/// Derived completion state of one task spec within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecOutcome {
    Succeeded,
    ExhaustedFailure,
    ExhaustedMishap,
    InProgress,
}

fn spec_outcome(attempts: &[&Task], budgets: RetryBudgets) -> SpecOutcome {
    if attempts.iter().any(|t| t.status == TaskStatus::Success) {
        return SpecOutcome::Succeeded;
    }
    let terminal: Vec<_> = attempts.iter().filter(|t| t.is_terminal()).collect();
    // Any non-terminal attempt means the spec is still being worked on.
    if terminal.len() < attempts.len() {
        return SpecOutcome::InProgress;
    }
    let latest = match terminal.last() {
        Some(t) => t.status,
        None => return SpecOutcome::InProgress,
    };
    let attempts_made = attempts.len() as u32;
    match latest {
        TaskStatus::Failure if attempts_made >= budgets.failure_attempts => {
            SpecOutcome::ExhaustedFailure
        }
        TaskStatus::Mishap if attempts_made >= budgets.mishap_attempts => {
            SpecOutcome::ExhaustedMishap
        }
        TaskStatus::Canceled => SpecOutcome::ExhaustedMishap,
        _ => SpecOutcome::InProgress,
    }
}

/// Fold the statuses of a job's member tasks into the job's derived status.
///
/// `attempts_by_spec` maps each task spec the job names to its attempts at
/// the job's RepoState, oldest first. Specs with no attempts yet count as
/// in-progress.
pub fn derive_status(
    job: &Job,
    attempts_by_spec: &BTreeMap<String, Vec<&Task>>,
    budgets: RetryBudgets,
) -> JobStatus {
    let mut any_failure = false;
    let mut any_mishap = false;
    let mut all_succeeded = true;
    for spec in &job.task_specs {
        let attempts = attempts_by_spec.get(spec).map(Vec::as_slice).unwrap_or(&[]);
        match spec_outcome(attempts, budgets) {
            SpecOutcome::Succeeded => {}
            SpecOutcome::ExhaustedFailure => {
                any_failure = true;
                all_succeeded = false;
            }
            SpecOutcome::ExhaustedMishap => {
                any_mishap = true;
                all_succeeded = false;
            }
            SpecOutcome::InProgress => all_succeeded = false,
        }
    }
    if all_succeeded {
        JobStatus::Success
    } else if any_failure {
        JobStatus::Failure
    } else if any_mishap {
        JobStatus::Mishap
    } else {
        JobStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(name: &str, status: TaskStatus) -> Task {
        Task {
            status,
            ..Task::new(RepoState::new("repo", "abc"), name)
        }
    }

    fn job(specs: &[&str]) -> Job {
        Job::new(
            RepoState::new("repo", "abc"),
            "J",
            specs.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn attempts<'a>(pairs: &[(&str, &'a [Task])]) -> BTreeMap<String, Vec<&'a Task>> {
        pairs
            .iter()
            .map(|(name, tasks)| (name.to_string(), tasks.iter().collect()))
            .collect()
    }

    #[test]
    fn all_specs_succeeded_means_success() {
        let build = [task("Build", TaskStatus::Success)];
        let test = [task("Test", TaskStatus::Failure), task("Test", TaskStatus::Success)];
        let status = derive_status(
            &job(&["Build", "Test"]),
            &attempts(&[("Build", &build), ("Test", &test)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::Success);
    }

    #[test]
    fn missing_attempts_mean_in_progress() {
        let build = [task("Build", TaskStatus::Success)];
        let status = derive_status(
            &job(&["Build", "Test"]),
            &attempts(&[("Build", &build)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::InProgress);
    }

    #[test]
    fn one_failure_within_budget_is_still_in_progress() {
        let build = [task("Build", TaskStatus::Failure)];
        let status = derive_status(
            &job(&["Build"]),
            &attempts(&[("Build", &build)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::InProgress);
    }

    #[test]
    fn exhausted_failures_mean_failure() {
        let build = [task("Build", TaskStatus::Failure), task("Build", TaskStatus::Failure)];
        let status = derive_status(
            &job(&["Build"]),
            &attempts(&[("Build", &build)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::Failure);
    }

    #[test]
    fn exhausted_mishaps_mean_mishap() {
        let build = [task("Build", TaskStatus::Mishap), task("Build", TaskStatus::Mishap)];
        let status = derive_status(
            &job(&["Build"]),
            &attempts(&[("Build", &build)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::Mishap);
    }

    #[test]
    fn failure_takes_precedence_over_mishap() {
        let build = [task("Build", TaskStatus::Failure), task("Build", TaskStatus::Failure)];
        let test = [task("Test", TaskStatus::Mishap), task("Test", TaskStatus::Mishap)];
        let status = derive_status(
            &job(&["Build", "Test"]),
            &attempts(&[("Build", &build), ("Test", &test)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::Failure);
    }

    #[test]
    fn running_retry_keeps_job_in_progress() {
        let build = [task("Build", TaskStatus::Mishap), task("Build", TaskStatus::Running)];
        let status = derive_status(
            &job(&["Build"]),
            &attempts(&[("Build", &build)]),
            RetryBudgets::default(),
        );
        assert_eq!(status, JobStatus::InProgress);
    }
}
