//! End-to-end scheduling scenarios over in-memory collaborators: mock
//! executor, in-memory repo client, in-memory stores.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use foreman_cfgcache::{MemCfgStore, TasksCfgCache};
use foreman_executor::{completion_channel, Executor, ExecutorTaskStatus, Machine, MockExecutor};
use foreman_lib::{Error, JobStatus, Patch, RepoState, Task, TaskStatus};
use foreman_repograph::{Commit, InMemoryRepoClient, RepoGraph, RepoMap, TASKS_CFG_FILE};
use foreman_scheduler::{completion_ingress, Scheduler, SchedulerConfig};
use foreman_skiprules::{commit_range, InMemoryRuleStore, SkipRule, SkipRules};
use foreman_taskdb::{JobCache, MemStore, RecordStore, TaskCache};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const REPO: &str = "https://example.com/repo.git";

const BUILD_ONLY_CFG: &str = r#"{
    "casSpecs": { "infra": { "root": ".", "paths": ["infra"], "digest": "abc/123" } },
    "tasks": {
        "Build": { "dimensions": ["os:Linux"], "casSpec": "infra", "priority": 0.8 }
    },
    "jobs": {
        "Build": { "priority": 0.8, "tasks": ["Build"] }
    }
}"#;

const BUILD_AND_TEST_CFG: &str = r#"{
    "casSpecs": { "infra": { "root": ".", "paths": ["infra"], "digest": "abc/123" } },
    "tasks": {
        "Build": { "dimensions": ["os:Linux"], "casSpec": "infra", "priority": 0.8 },
        "Test": { "dependencies": ["Build"], "dimensions": ["os:Linux"], "casSpec": "infra", "priority": 0.8 }
    },
    "jobs": {
        "Test": { "priority": 0.8, "tasks": ["Test"] }
    }
}"#;

struct Harness {
    repos: Arc<RwLock<RepoMap>>,
    repo_client: Arc<InMemoryRepoClient>,
    executor: Arc<MockExecutor>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
}

impl Harness {
    /// Linear chain of commits (oldest first), every revision carrying
    /// `cfg_json` as its tasks file.
    async fn new(hashes: &[&str], cfg_json: &str) -> Self {
        let now = Utc::now();
        let mut graph = RepoGraph::new(REPO);
        for (i, hash) in hashes.iter().enumerate() {
            graph.insert(Commit {
                hash: hash.to_string(),
                parents: if i == 0 {
                    vec![]
                } else {
                    vec![hashes[i - 1].to_string()]
                },
                author: "author@example.com".into(),
                subject: format!("commit {hash}"),
                timestamp: now - Duration::minutes((hashes.len() - i) as i64),
            });
        }
        let mut map = RepoMap::new();
        map.insert(graph);
        let repos = Arc::new(RwLock::new(map));

        let repo_client = Arc::new(InMemoryRepoClient::new());
        for hash in hashes {
            repo_client.put_file(REPO, hash, TASKS_CFG_FILE, cfg_json.as_bytes());
        }
        let cfg_cache = Arc::new(TasksCfgCache::new(
            repo_client.clone(),
            Arc::new(MemCfgStore::new()),
        ));
        let skip_rules = SkipRules::new(Arc::new(InMemoryRuleStore::new()));
        let store = Arc::new(MemStore::new());
        let tasks = Arc::new(TaskCache::new(store.clone()));
        let jobs = Arc::new(JobCache::new(store));
        let executor = Arc::new(MockExecutor::new());
        let scheduler = Arc::new(Scheduler::new(
            repos.clone(),
            cfg_cache,
            skip_rules,
            tasks,
            jobs,
            executor.clone(),
            SchedulerConfig::default(),
        ));
        Self {
            repos,
            repo_client,
            executor,
            scheduler,
            cancel: CancellationToken::new(),
        }
    }

    fn set_linux_machines(&self, count: usize) {
        let machines = (1..=count)
            .map(|i| Machine::new(format!("machine-{i:02}"), &["os:Linux"]))
            .collect();
        self.executor.set_machines(machines);
    }

    async fn tick(&self) -> foreman_scheduler::TickSummary {
        self.scheduler.tick(&self.cancel).await.unwrap()
    }

    async fn all_tasks(&self) -> Vec<Task> {
        self.scheduler
            .tasks()
            .store()
            .get_tasks_created_after(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap()
    }

    /// Drive an executor task to a terminal status and deliver the
    /// completion to the scheduler, as the pub/sub path would.
    async fn complete(&self, executor_task_id: &str, status: ExecutorTaskStatus) {
        self.executor.complete_task(executor_task_id, status, "out/123");
        let userdata = self
            .executor
            .triggered()
            .into_iter()
            .find(|t| t.id == executor_task_id)
            .unwrap()
            .userdata;
        self.scheduler
            .handle_completion(executor_task_id, &userdata)
            .await
            .unwrap();
    }
}

// S1: single commit, single task, happy path.
#[tokio::test]
async fn single_commit_single_task_happy_path() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    let summary = h.tick().await;
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.errors, 0);

    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.name, "Build");
    assert_eq!(task.repo_state, RepoState::new(REPO, "A"));
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.commits, vec!["A"]);
    assert!(!task.executor_task_id.is_empty());
    assert_eq!(task.machine_id, "machine-01");
    assert_eq!(h.executor.trigger_count(), 1);
    // Reservations are released once the record is written.
    assert!(h.scheduler.busy().reserved().is_empty());

    // The request carried the spec's dimensions and the scheduler task ID.
    let request = h.executor.request_for(&task.executor_task_id).unwrap();
    assert_eq!(request.dimensions, vec!["os:Linux"]);
    assert_eq!(request.userdata, task.id);
    assert_eq!(request.cas_input, "abc/123");
}

// Property 1: no duplicate non-terminal task per (RepoState, spec).
#[tokio::test]
async fn pending_task_suppresses_duplicate_candidates() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    h.tick().await;
    let second = h.tick().await;
    assert_eq!(second.candidates, 0);
    assert_eq!(second.dispatched, 0);
    assert_eq!(h.all_tasks().await.len(), 1);
    assert_eq!(h.executor.trigger_count(), 1);
}

// S2: dependency chain. Only Build dispatches first; Test follows once
// Build succeeds.
#[tokio::test]
async fn dependency_chain_dispatches_in_order() {
    let h = Harness::new(&["A"], BUILD_AND_TEST_CFG).await;
    h.set_linux_machines(2);

    h.tick().await;
    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 1, "only Build may dispatch: {tasks:?}");
    assert_eq!(tasks[0].name, "Build");

    h.complete(&tasks[0].executor_task_id, ExecutorTaskStatus::Completed)
        .await;
    assert_eq!(
        h.scheduler.tasks().get(&tasks[0].id).await.unwrap().status,
        TaskStatus::Success
    );

    h.tick().await;
    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 2);
    let test = tasks.iter().find(|t| t.name == "Test").unwrap();
    // Property 2: the dependency had a terminal success at dispatch time,
    // and its ID is recorded.
    assert_eq!(test.parent_task_ids, vec![tasks[0].id.clone()]);
}

// S3: blame bisection. Build succeeded at A; candidate D carries blame
// {B, C, D} and outscores shorter-blame candidates for the one machine.
#[tokio::test]
async fn blame_bisection_selects_largest_gap() {
    let h = Harness::new(&["A", "B", "C", "D"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    let mut prior = Task {
        status: TaskStatus::Success,
        commits: vec!["A".into()],
        ..Task::new(RepoState::new(REPO, "A"), "Build")
    };
    h.scheduler.tasks().put_task(&mut prior).await.unwrap();

    let summary = h.tick().await;
    // Candidates at B, C and D; A already succeeded.
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.dispatched, 1);

    let dispatched: Vec<Task> = h
        .all_tasks()
        .await
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].repo_state.revision, "D");
    assert_eq!(dispatched[0].commits, vec!["D", "C", "B"]);
}

// Property 6: strictly higher score wins the contended machine.
#[tokio::test]
async fn higher_scored_candidate_wins_the_machine() {
    let h = Harness::new(&["A", "B"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    h.tick().await;
    let dispatched = h.all_tasks().await;
    assert_eq!(dispatched.len(), 1);
    // B's blame is {A, B} (len 2) vs A's {A} (len 1).
    assert_eq!(dispatched[0].repo_state.revision, "B");
    assert_eq!(dispatched[0].commits, vec!["B", "A"]);
}

// S4: a skip rule masks its commit range; ends outside the range are
// unaffected.
#[tokio::test]
async fn skip_rule_masks_commit_range() {
    let h = Harness::new(&["A", "B", "C", "D"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(4);

    let repos = h.repos.read().await.clone();
    let commits = commit_range(&repos, REPO, "B", "D").unwrap();
    assert_eq!(commits, vec!["C".to_string(), "B".to_string()]);

    // Recreate the scheduler's view through its store so both see the rule.
    let store = Arc::new(InMemoryRuleStore::new());
    let rules = SkipRules::new(store);
    rules
        .add_rule(
            SkipRule {
                name: "mask-b-to-d".into(),
                added_by: "sheriff@example.com".into(),
                description: "bad commits".into(),
                task_spec_patterns: vec![],
                commits,
            },
            &repos,
        )
        .await
        .unwrap();

    // The harness scheduler was built with its own empty view; rebuild one
    // sharing the populated view.
    let h2 = Harness::new(&["A", "B", "C", "D"], BUILD_ONLY_CFG).await;
    h2.set_linux_machines(4);
    let scheduler = Arc::new(Scheduler::new(
        h2.repos.clone(),
        Arc::new(TasksCfgCache::new(
            h2.repo_client.clone(),
            Arc::new(MemCfgStore::new()),
        )),
        rules,
        h2.scheduler.tasks().clone(),
        h2.scheduler.jobs().clone(),
        h2.executor.clone(),
        SchedulerConfig::default(),
    ));

    let summary = scheduler.tick(&h2.cancel).await.unwrap();
    assert_eq!(summary.candidates, 2);
    let mut revisions: Vec<String> = h2
        .all_tasks()
        .await
        .into_iter()
        .map(|t| t.repo_state.revision)
        .collect();
    revisions.sort();
    assert_eq!(revisions, vec!["A".to_string(), "D".to_string()]);
}

// S5: retry on mishap, with the job going terminal once the budget is
// exhausted.
#[tokio::test]
async fn mishap_retries_then_job_goes_terminal() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    let job = h
        .scheduler
        .request_job(RepoState::new(REPO, "A"), "Build", false)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Requested);

    // Attempt 0 dispatches and mishaps.
    h.tick().await;
    let first = h.all_tasks().await.pop().unwrap();
    assert_eq!(first.attempt, 0);
    h.complete(&first.executor_task_id, ExecutorTaskStatus::Mishap)
        .await;

    // Attempt 1 is a fresh task for the same pair.
    h.tick().await;
    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 2);
    let second = tasks
        .iter()
        .find(|t| t.id != first.id)
        .unwrap()
        .clone();
    assert_eq!(second.name, "Build");
    assert_eq!(second.repo_state, first.repo_state);
    assert_eq!(second.attempt, 1);

    h.complete(&second.executor_task_id, ExecutorTaskStatus::Mishap)
        .await;

    // Budget exhausted: no third attempt, job terminal mishap.
    let summary = h.tick().await;
    assert_eq!(summary.candidates, 0);
    assert_eq!(h.all_tasks().await.len(), 2);
    let job = h.scheduler.jobs().get(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Mishap);
    assert!(job.finished.is_some());
}

// Job lifecycle: requested -> in-progress -> success, with member tasks
// recorded per spec.
#[tokio::test]
async fn job_succeeds_with_its_member_task() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    let job = h
        .scheduler
        .request_job(RepoState::new(REPO, "A"), "Build", true)
        .await
        .unwrap();
    assert!(job.is_force);

    h.tick().await;
    let job_now = h.scheduler.jobs().get(&job.id).await.unwrap();
    assert_eq!(job_now.status, JobStatus::InProgress);

    let task = h.all_tasks().await.pop().unwrap();
    h.complete(&task.executor_task_id, ExecutorTaskStatus::Completed)
        .await;

    let job_done = h.scheduler.jobs().get(&job.id).await.unwrap();
    assert_eq!(job_done.status, JobStatus::Success);
    assert_eq!(job_done.tasks["Build"], vec![task.id]);
}

// Forced jobs at patched RepoStates enter the pipeline through the
// try-job path and blame only their own revision.
#[tokio::test]
async fn try_job_at_patched_repo_state_dispatches() {
    let h = Harness::new(&["A", "B"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(4);

    let patch = Patch {
        code_review: "https://review.example.com".into(),
        change_id: "4567".into(),
        patchset_id: "2".into(),
    };
    h.repo_client
        .put_patched_file(&patch, TASKS_CFG_FILE, BUILD_ONLY_CFG.as_bytes());
    let repo_state = RepoState::new(REPO, "B").with_patch(patch);

    h.scheduler
        .request_job(repo_state.clone(), "Build", true)
        .await
        .unwrap();

    h.tick().await;
    let tasks = h.all_tasks().await;
    let try_task = tasks
        .iter()
        .find(|t| t.repo_state == repo_state)
        .expect("try job task dispatched");
    assert_eq!(try_task.commits, vec!["B"]);
}

// Trigger failure marks the task mishap and frees the machine for the
// next tick's retry.
#[tokio::test]
async fn trigger_failure_becomes_mishap_and_retries() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);
    h.executor
        .fail_next_trigger(Error::TransientExecutor("executor down".into()));

    let summary = h.tick().await;
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.errors, 1);
    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Mishap);
    assert!(h.scheduler.busy().reserved().is_empty());

    // Next tick retries with a fresh attempt.
    let summary = h.tick().await;
    assert_eq!(summary.dispatched, 1);
    let tasks = h.all_tasks().await;
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().any(|t| t.status == TaskStatus::Pending));
}

// Cancellation is terminal and idempotent, and kills the executor task.
#[tokio::test]
async fn cancel_task_is_idempotent() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);
    h.tick().await;

    let task = h.all_tasks().await.pop().unwrap();
    h.scheduler.cancel_task(&task.id).await.unwrap();
    h.scheduler.cancel_task(&task.id).await.unwrap();

    let task_now = h.scheduler.tasks().get(&task.id).await.unwrap();
    assert_eq!(task_now.status, TaskStatus::Canceled);
    let executor_side = h
        .executor
        .get_task_result(&task.executor_task_id)
        .await
        .unwrap();
    assert_eq!(executor_side.status, ExecutorTaskStatus::Canceled);

    // Canceled pairs are not re-attempted.
    let summary = h.tick().await;
    assert_eq!(summary.candidates, 0);
}

// Completion events delivered over the pub/sub channel reach the record,
// and replays are harmless.
#[tokio::test]
async fn completion_ingress_applies_events_idempotently() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);

    let (tx, rx) = completion_channel(16);
    h.executor.attach_completion_sender(tx);
    let ingress = tokio::spawn(completion_ingress(
        h.scheduler.clone(),
        rx,
        h.cancel.clone(),
    ));

    h.tick().await;
    let task = h.all_tasks().await.pop().unwrap();
    // Publish twice: at-least-once delivery.
    h.executor
        .complete_task(&task.executor_task_id, ExecutorTaskStatus::Completed, "d/1");
    h.executor
        .complete_task(&task.executor_task_id, ExecutorTaskStatus::Completed, "d/1");

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let status = h.scheduler.tasks().get(&task.id).await.unwrap().status;
        if status == TaskStatus::Success {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "completion never applied, status {status:?}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    h.cancel.cancel();
    ingress.await.unwrap();
}

// The safety-net sweep picks up completions whose notifications were
// lost.
#[tokio::test]
async fn reconcile_recovers_lost_completions() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.set_linux_machines(1);
    h.tick().await;

    let task = h.all_tasks().await.pop().unwrap();
    // Terminal on the executor side, but no notification delivered.
    h.executor
        .complete_task(&task.executor_task_id, ExecutorTaskStatus::Failed, "d/1");

    // Make the task old enough for the sweep by backdating its creation.
    let mut backdated = h.scheduler.tasks().get(&task.id).await.unwrap();
    backdated.created = Utc::now() - Duration::hours(1);
    h.scheduler.tasks().put_task(&mut backdated).await.unwrap();

    h.scheduler.reconcile().await.unwrap();
    assert_eq!(
        h.scheduler.tasks().get(&task.id).await.unwrap().status,
        TaskStatus::Failure
    );
}

// No machine satisfies the dimensions: the candidate is silently dropped,
// nothing is triggered.
#[tokio::test]
async fn unsatisfiable_dimensions_suppress_the_candidate() {
    let h = Harness::new(&["A"], BUILD_ONLY_CFG).await;
    h.executor
        .set_machines(vec![Machine::new("mac-01", &["os:Mac"])]);

    let summary = h.tick().await;
    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.dispatched, 0);
    assert!(h.all_tasks().await.is_empty());
    assert_eq!(h.executor.trigger_count(), 0);
}
