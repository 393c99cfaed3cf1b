use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use foreman_cfgcache::{CacheStats, TasksCfgCache};
use foreman_executor::{Executor, Machine, TaskRequest, TaskResult};
use foreman_lib::{
    job::derive_status, Error, Job, JobStatus, RepoState, Result, RetryBudgets, Task, TaskStatus,
    TasksCfg,
};
use foreman_repograph::{RepoGraph, RepoMap, Window};
use foreman_skiprules::SkipRules;
use foreman_taskdb::{JobCache, RecordStore, TaskCache};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::busy::BusyMachines;
use crate::candidate::Candidate;
use crate::matcher;
use crate::metrics;
use crate::scoring;

/// Tunables of the scheduling engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Machine pool tasks are dispatched to.
    pub pool: String,
    /// Time extent of the commit window.
    pub window_duration: Duration,
    /// Per-repo floor: keep at least this many recent commits in-window.
    pub window_min_commits: usize,
    pub budgets: RetryBudgets,
    /// TTL of busy-machine reservations.
    pub busy_ttl: StdDuration,
    /// Bound on concurrent config fetches during enumeration.
    pub fetch_parallelism: usize,
    /// Attempts per record update before a CAS conflict is surfaced.
    pub cas_attempts: u32,
    /// Non-terminal tasks older than this are reconciled against the
    /// executor by the safety-net sweep.
    pub reconcile_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool: "default".to_string(),
            window_duration: Duration::hours(24),
            window_min_commits: 5,
            budgets: RetryBudgets::default(),
            busy_ttl: StdDuration::from_secs(30),
            fetch_parallelism: 8,
            cas_attempts: 5,
            reconcile_age: Duration::minutes(10),
        }
    }
}

/// Outcome of one tick, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub candidates: usize,
    pub dispatched: usize,
    pub errors: usize,
}

/// The scheduling engine (component H) and its busy-machine registry
/// (component G).
pub struct Scheduler {
    repos: Arc<RwLock<RepoMap>>,
    cfg_cache: Arc<TasksCfgCache>,
    skip_rules: SkipRules,
    tasks: Arc<TaskCache>,
    jobs: Arc<JobCache>,
    executor: Arc<dyn Executor>,
    busy: BusyMachines,
    config: SchedulerConfig,
    // Ticks must not overlap.
    tick_lock: Mutex<()>,
    // Config-cache counters already exported; the tick exports the delta.
    cache_stats_seen: std::sync::Mutex<CacheStats>,
}

impl Scheduler {
    pub fn new(
        repos: Arc<RwLock<RepoMap>>,
        cfg_cache: Arc<TasksCfgCache>,
        skip_rules: SkipRules,
        tasks: Arc<TaskCache>,
        jobs: Arc<JobCache>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
    ) -> Self {
        let busy = BusyMachines::new(config.busy_ttl);
        Self {
            repos,
            cfg_cache,
            skip_rules,
            tasks,
            jobs,
            executor,
            busy,
            config,
            tick_lock: Mutex::new(()),
            cache_stats_seen: std::sync::Mutex::new(CacheStats::default()),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskCache> {
        &self.tasks
    }

    pub fn jobs(&self) -> &Arc<JobCache> {
        &self.jobs
    }

    pub fn busy(&self) -> &BusyMachines {
        &self.busy
    }

    /// Rebuild the task/job caches from the durable store, bounded by the
    /// current window. Called once on startup.
    pub async fn rebuild_caches(&self) -> Result<()> {
        let repos = self.repos.read().await.clone();
        let window = self.window(&repos, Utc::now());
        let start = window.earliest_start().unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.tasks.rebuild(start).await?;
        self.jobs.rebuild(start).await?;
        Ok(())
    }

    /// Run ticks at `interval` until cancelled.
    pub async fn main_loop(&self, interval: StdDuration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler main loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.tick(&cancel).await {
                        Ok(summary) => tracing::info!(
                            "tick done: {} candidates, {} dispatched, {} errors",
                            summary.candidates, summary.dispatched, summary.errors
                        ),
                        Err(e) => tracing::error!("tick failed: {e}"),
                    }
                }
            }
        }
    }

    /// One scheduling iteration: enumerate, score, match, dispatch.
    ///
    /// Per-candidate failures are logged and counted; only
    /// infrastructure-level failures (executor unreachable, store down,
    /// cancellation) abort the tick.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary> {
        let _guard = self.tick_lock.lock().await;
        let started = std::time::Instant::now();
        metrics::TICK_COUNT.inc();

        let now = Utc::now();
        let repos = self.repos.read().await.clone();
        let window = self.window(&repos, now);

        self.expire_caches(&repos, &window, now).await;

        let machines = self.executor.get_free_machines(&self.config.pool).await?;
        let reserved = self.busy.reserved();
        let available: Vec<Machine> = machines
            .into_iter()
            .filter(|m| !reserved.contains(&m.id))
            .collect();

        let mut candidates = self.enumerate(&repos, &window, &available, cancel).await?;
        candidates.sort_by(Candidate::dispatch_order);
        metrics::CANDIDATE_COUNT.observe(candidates.len() as f64);

        // Candidates emitted on the strength of same-tick dependency
        // candidates cannot dispatch yet; they wait for the dependency's
        // success to land.
        let dispatchable: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.deps_satisfied)
            .cloned()
            .collect();
        let assignments = matcher::assign(&dispatchable, &available);

        let mut summary = TickSummary {
            candidates: candidates.len(),
            ..TickSummary::default()
        };
        for (index, machine_id) in assignments {
            if cancel.is_cancelled() {
                tracing::warn!("tick cancelled mid-dispatch, stopping");
                break;
            }
            match self.dispatch(&dispatchable[index], &machine_id).await {
                Ok(()) => {
                    summary.dispatched += 1;
                    metrics::DISPATCH_COUNT.inc();
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!("dispatch of {} failed: {e}", dispatchable[index]);
                }
            }
        }

        if let Err(e) = self.update_unfinished_jobs().await {
            summary.errors += 1;
            tracing::error!("job status derivation failed: {e}");
        }

        self.export_cache_stats();
        metrics::TICK_DURATION_MILLIS.observe(started.elapsed().as_millis() as f64);
        Ok(summary)
    }

    // Export the config cache's hit/miss counters as prometheus deltas.
    fn export_cache_stats(&self) {
        let stats = self.cfg_cache.stats();
        let mut seen = self.cache_stats_seen.lock().unwrap();
        metrics::CFG_CACHE_LOOKUP_COUNT
            .with_label_values(&["hit"])
            .inc_by(stats.hits.saturating_sub(seen.hits) as f64);
        metrics::CFG_CACHE_LOOKUP_COUNT
            .with_label_values(&["miss"])
            .inc_by(stats.misses.saturating_sub(seen.misses) as f64);
        *seen = stats;
    }

    fn window(&self, repos: &RepoMap, now: DateTime<Utc>) -> Window {
        Window::compute(
            self.config.window_duration,
            self.config.window_min_commits,
            repos,
            now,
        )
    }

    async fn expire_caches(&self, repos: &RepoMap, window: &Window, now: DateTime<Utc>) {
        self.tasks
            .expire(|rs| Self::in_window(repos, window, rs))
            .await;
        self.jobs
            .expire(|rs| Self::in_window(repos, window, rs))
            .await;
        if let Some(earliest) = window.earliest_start() {
            if let Err(e) = self.cfg_cache.cleanup(now - earliest).await {
                tracing::warn!("config cache cleanup failed: {e}");
            }
        }
    }

    fn in_window(repos: &RepoMap, window: &Window, repo_state: &RepoState) -> bool {
        match repos
            .get(&repo_state.repo)
            .and_then(|g| g.get(&repo_state.revision))
        {
            Some(commit) => window.test_time(&repo_state.repo, commit.timestamp),
            None => false,
        }
    }

    // Candidate enumeration over the window, newest-first per repo, plus
    // the patched RepoStates of unfinished try jobs.
    async fn enumerate(
        &self,
        repos: &RepoMap,
        window: &Window,
        machines: &[Machine],
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        // Specs named by unfinished forced jobs, for the score boost.
        let mut forced: HashMap<RepoState, HashSet<String>> = HashMap::new();
        let mut try_states: BTreeMap<RepoState, BTreeSet<String>> = BTreeMap::new();
        for job in self.jobs.unfinished().await {
            if job.is_force {
                forced
                    .entry(job.repo_state.clone())
                    .or_default()
                    .extend(job.task_specs.iter().cloned());
            }
            if job.repo_state.patch.is_some() {
                try_states
                    .entry(job.repo_state.clone())
                    .or_default()
                    .extend(job.task_specs.iter().cloned());
            }
        }

        let mut candidates = Vec::new();
        for repo_name in repos.repo_names() {
            if cancel.is_cancelled() {
                break;
            }
            let graph = repos.get(&repo_name).expect("repo_names is consistent");
            let Some(start) = window.start(&repo_name) else {
                continue;
            };
            let commits: Vec<(String, DateTime<Utc>)> = graph
                .commits_since(start)
                .into_iter()
                .map(|c| (c.hash.clone(), c.timestamp))
                .collect();

            let cfgs = self.fetch_cfgs(&repo_name, &commits).await;

            for (hash, commit_ts) in &commits {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(cfg) = cfgs.get(hash) else {
                    continue;
                };
                let repo_state = RepoState::new(repo_name.clone(), hash.clone());
                let emitted = self
                    .candidates_for_state(
                        &repo_state,
                        *commit_ts,
                        cfg,
                        None,
                        graph,
                        window,
                        machines,
                        &forced,
                    )
                    .await;
                candidates.extend(emitted);
            }

            // Try jobs: patched RepoStates never appear in the commit
            // window, so enumerate them off the unfinished-jobs index.
            for (repo_state, job_specs) in &try_states {
                if repo_state.repo != repo_name {
                    continue;
                }
                let Some(commit) = graph.get(&repo_state.revision) else {
                    continue;
                };
                let cfg = match self.cfg_cache.get(repo_state, commit.timestamp).await {
                    Ok(Ok(cfg)) => cfg,
                    Ok(Err(stored)) => {
                        tracing::debug!("skipping {repo_state}: sticky config error: {stored}");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("config fetch for {repo_state} failed: {e}");
                        continue;
                    }
                };
                let allowed = dependency_closure(&cfg, job_specs);
                let emitted = self
                    .candidates_for_state(
                        repo_state,
                        commit.timestamp,
                        &cfg,
                        Some(&allowed),
                        graph,
                        window,
                        machines,
                        &forced,
                    )
                    .await;
                candidates.extend(emitted);
            }
        }
        Ok(candidates)
    }

    // Fetch configs for a batch of commits with bounded parallelism.
    // Sticky and transient failures are logged and dropped; the tick goes
    // on without those commits.
    async fn fetch_cfgs(
        &self,
        repo: &str,
        commits: &[(String, DateTime<Utc>)],
    ) -> HashMap<String, Arc<TasksCfg>> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_parallelism));
        let mut join_set = JoinSet::new();
        for (hash, commit_ts) in commits {
            let semaphore = semaphore.clone();
            let cfg_cache = self.cfg_cache.clone();
            let repo_state = RepoState::new(repo.to_string(), hash.clone());
            let commit_ts = *commit_ts;
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let result = cfg_cache.get(&repo_state, commit_ts).await;
                (repo_state, result)
            });
        }
        let mut cfgs = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((repo_state, Ok(Ok(cfg)))) => {
                    cfgs.insert(repo_state.revision, cfg);
                }
                Ok((repo_state, Ok(Err(stored)))) => {
                    tracing::debug!("skipping {repo_state}: sticky config error: {stored}");
                }
                Ok((repo_state, Err(e))) => {
                    tracing::warn!("config fetch for {repo_state} failed: {e}");
                }
                Err(e) => tracing::error!("config fetch task failed: {e}"),
            }
        }
        cfgs
    }

    // Emit candidates for one RepoState: filter each spec (skip rules,
    // duplicates, retry budgets, machine satisfiability), then gate on
    // dependencies with a fixpoint that admits specs whose missing
    // dependencies are themselves emitted this tick.
    #[allow(clippy::too_many_arguments)]
    async fn candidates_for_state(
        &self,
        repo_state: &RepoState,
        commit_ts: DateTime<Utc>,
        cfg: &Arc<TasksCfg>,
        allowed: Option<&BTreeSet<String>>,
        graph: &RepoGraph,
        window: &Window,
        machines: &[Machine],
        forced: &HashMap<RepoState, HashSet<String>>,
    ) -> Vec<Candidate> {
        let budgets = self.config.budgets;
        let mut attempts_map: BTreeMap<&str, Vec<Task>> = BTreeMap::new();
        for name in cfg.tasks.keys() {
            attempts_map.insert(name.as_str(), self.tasks.attempts(repo_state, name).await);
        }
        let success_now: HashSet<&str> = attempts_map
            .iter()
            .filter(|(_, attempts)| {
                attempts.iter().any(|t| t.status == TaskStatus::Success)
            })
            .map(|(name, _)| *name)
            .collect();

        let mut emitted: BTreeSet<&str> = BTreeSet::new();
        for (name, spec) in &cfg.tasks {
            if let Some(allowed) = allowed {
                if !allowed.contains(name) {
                    continue;
                }
            }
            if let Some(rule) = self.skip_rules.match_rule(name, &repo_state.revision) {
                tracing::trace!("{name} @ {repo_state} masked by skip rule {rule:?}");
                continue;
            }
            let attempts = &attempts_map[name.as_str()];
            if attempts.iter().any(|t| !t.is_terminal()) {
                continue;
            }
            if success_now.contains(name.as_str()) {
                continue;
            }
            if let Some(latest) = attempts.last() {
                let exhausted = match latest.status {
                    TaskStatus::Failure => attempts.len() as u32 >= budgets.failure_attempts,
                    TaskStatus::Mishap => attempts.len() as u32 >= budgets.mishap_attempts,
                    TaskStatus::Canceled => true,
                    _ => false,
                };
                if exhausted {
                    continue;
                }
            }
            // Unsatisfiable dimensions are silently dropped here; only the
            // executor may raise a hard no-resource error.
            if !machines.iter().any(|m| m.can_run(&spec.dimensions)) {
                continue;
            }
            emitted.insert(name);
        }

        // Dependency gating fixpoint: keep a spec only while each of its
        // dependencies has a success or is itself still emitted.
        loop {
            let before = emitted.len();
            let current = emitted.clone();
            emitted.retain(|name| {
                cfg.tasks[*name].dependencies.iter().all(|dep| {
                    success_now.contains(dep.as_str()) || current.contains(dep.as_str())
                })
            });
            if emitted.len() == before {
                break;
            }
        }

        let forced_specs = forced.get(repo_state);
        let mut candidates = Vec::new();
        for name in emitted {
            let spec = &cfg.tasks[name];
            let attempts = &attempts_map[name];
            let deps_satisfied = spec
                .dependencies
                .iter()
                .all(|dep| success_now.contains(dep.as_str()));
            let parent_task_ids: Vec<String> = spec
                .dependencies
                .iter()
                .filter_map(|dep| {
                    attempts_map[dep.as_str()]
                        .iter()
                        .rev()
                        .find(|t| t.status == TaskStatus::Success)
                        .map(|t| t.id.clone())
                })
                .collect();
            // A patched state speaks only for itself; post-submit states
            // blame the unvetted first-parent chain.
            let blame = if repo_state.patch.is_some() {
                vec![repo_state.revision.clone()]
            } else {
                scoring::blame_list(graph, window, &self.tasks, &repo_state.revision, name).await
            };
            let is_forced = forced_specs.is_some_and(|specs| specs.contains(name));
            let score = scoring::score(spec.priority, blame.len(), is_forced);
            let cas_input = cfg
                .cas_specs
                .get(&spec.cas_spec)
                .and_then(|c| c.digest.clone())
                .unwrap_or_default();
            candidates.push(Candidate {
                repo_state: repo_state.clone(),
                name: name.to_string(),
                spec: spec.clone(),
                blame,
                score,
                forced: is_forced,
                attempt: attempts.len() as u32,
                parent_task_ids,
                deps_satisfied,
                commit_ts,
                cas_input,
            });
        }
        candidates
    }

    // One dispatch: reserve the machine, write the pending record, trigger
    // the executor, record the handle (or the mishap).
    async fn dispatch(&self, candidate: &Candidate, machine_id: &str) -> Result<()> {
        if !self.busy.reserve(machine_id) {
            return Err(Error::Validation(format!(
                "machine {machine_id} is already reserved"
            )));
        }

        let mut task = Task {
            status: TaskStatus::Pending,
            attempt: candidate.attempt,
            commits: candidate.blame.clone(),
            parent_task_ids: candidate.parent_task_ids.clone(),
            ..Task::new(candidate.repo_state.clone(), &candidate.name)
        };
        if let Err(e) = self.tasks.put_task(&mut task).await {
            self.busy.release(machine_id);
            return Err(e);
        }

        let mut request =
            TaskRequest::from_spec(&candidate.name, &self.config.pool, &candidate.spec);
        request.userdata = task.id.clone();
        request.cas_input = candidate.cas_input.clone();

        match self.executor.trigger_task(&request).await {
            Ok(result) => {
                let machine = machine_id.to_string();
                self.update_task(&task.id, |t| {
                    t.executor_task_id = result.id.clone();
                    if t.machine_id.is_empty() {
                        t.machine_id = machine.clone();
                    }
                })
                .await?;
                self.busy.release(machine_id);
                tracing::info!("dispatched {} to {machine_id} as {}", task, result.id);
                Ok(())
            }
            Err(e) => {
                let cause = match &e {
                    Error::NoResource(_) => "no_resource",
                    _ => "trigger_failed",
                };
                metrics::DISPATCH_FAILURE_COUNT
                    .with_label_values(&[cause])
                    .inc();
                let write = self
                    .update_task(&task.id, |t| {
                        if !t.is_terminal() {
                            t.status = TaskStatus::Mishap;
                            t.finished = Some(Utc::now());
                        }
                    })
                    .await;
                if let Err(we) = write {
                    tracing::error!("recording trigger failure for {} failed: {we}", task.id);
                }
                self.busy.release(machine_id);
                Err(e)
            }
        }
    }

    /// Apply an executor result to the scheduler's task record. Idempotent:
    /// terminal records are never overwritten.
    pub async fn apply_result(&self, task_id: &str, result: &TaskResult) -> Result<()> {
        let status = result.status.to_task_status();
        let updated = self
            .update_task(task_id, |t| {
                if t.is_terminal() {
                    return;
                }
                t.status = status;
                if t.executor_task_id.is_empty() {
                    t.executor_task_id = result.id.clone();
                }
                if !result.machine_id.is_empty() {
                    t.machine_id = result.machine_id.clone();
                }
                if t.started.is_none() {
                    t.started = result.started;
                }
                if status.is_terminal() {
                    t.finished = result.completed.or_else(|| Some(Utc::now()));
                    t.output = result.output.clone();
                }
            })
            .await?;
        metrics::COMPLETION_COUNT
            .with_label_values(&[&format!("{:?}", updated.status)])
            .inc();
        Ok(())
    }

    /// Handle one completion notification. At-least-once delivery: replays
    /// for already-terminal tasks are no-ops.
    pub async fn handle_completion(&self, executor_task_id: &str, userdata: &str) -> Result<()> {
        let known = match self.tasks.get(userdata).await {
            Some(task) => Some(task),
            None => self.tasks.store().get_task(userdata).await?,
        };
        let Some(task) = known else {
            tracing::warn!("completion for unknown task {userdata:?}, dropping");
            return Ok(());
        };
        if task.is_terminal() {
            return Ok(());
        }
        let result = self.executor.get_task_result(executor_task_id).await?;
        self.apply_result(userdata, &result).await?;
        self.update_unfinished_jobs().await
    }

    /// Safety net for lost notifications: poll the executor for every
    /// non-terminal task older than the configured age and reconcile.
    pub async fn reconcile(&self) -> Result<()> {
        let cutoff = Utc::now() - self.config.reconcile_age;
        let stale: Vec<Task> = self
            .tasks
            .unfinished()
            .await
            .into_iter()
            .filter(|t| t.created < cutoff && !t.executor_task_id.is_empty())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = stale.iter().map(|t| t.executor_task_id.clone()).collect();
        let finished = self.executor.get_task_completion_statuses(&ids).await?;
        let mut reconciled = 0usize;
        for (task, done) in stale.iter().zip(finished) {
            if !done {
                continue;
            }
            let result = self.executor.get_task_result(&task.executor_task_id).await?;
            self.apply_result(&task.id, &result).await?;
            reconciled += 1;
        }
        if reconciled > 0 {
            tracing::info!("reconciled {reconciled} lost task completions");
            self.update_unfinished_jobs().await?;
        }
        Ok(())
    }

    /// Create a job at `repo_state`. Forced jobs boost their candidates'
    /// scores and, for patched RepoStates, are the only way work enters
    /// the pipeline.
    pub async fn request_job(
        &self,
        repo_state: RepoState,
        name: &str,
        is_force: bool,
    ) -> Result<Job> {
        let commit_ts = {
            let repos = self.repos.read().await;
            repos
                .get(&repo_state.repo)
                .and_then(|g| g.get(&repo_state.revision))
                .map(|c| c.timestamp)
                .ok_or_else(|| {
                    Error::Validation(format!("unknown revision {repo_state}"))
                })?
        };
        let cfg = self
            .cfg_cache
            .get(&repo_state, commit_ts)
            .await?
            .map_err(|stored| Error::PermanentConfig(stored.error))?;
        let job_spec = cfg.jobs.get(name).ok_or_else(|| {
            Error::Validation(format!("no job {name:?} at {repo_state}"))
        })?;
        let mut job = Job::new(repo_state, name, job_spec.tasks.clone());
        job.priority = job_spec.priority;
        job.is_force = is_force;
        self.jobs.put_job(&mut job).await?;
        tracing::info!("requested job {job}");
        Ok(job)
    }

    /// Forcibly cancel a task: terminal `canceled` in the store, and the
    /// executor-side task is killed. Idempotent.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let known = match self.tasks.get(task_id).await {
            Some(task) => Some(task),
            None => self.tasks.store().get_task(task_id).await?,
        };
        let Some(task) = known else {
            return Err(Error::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        };
        if task.is_terminal() {
            return Ok(());
        }
        self.update_task(task_id, |t| {
            if !t.is_terminal() {
                t.status = TaskStatus::Canceled;
                t.finished = Some(Utc::now());
            }
        })
        .await?;
        if !task.executor_task_id.is_empty() {
            self.executor.cancel_task(&task.executor_task_id).await?;
        }
        self.update_unfinished_jobs().await
    }

    /// Fold member-task statuses into each unfinished job's status.
    pub async fn update_unfinished_jobs(&self) -> Result<()> {
        for job in self.jobs.unfinished().await {
            let mut attempts_by_spec: BTreeMap<String, Vec<Task>> = BTreeMap::new();
            for spec in &job.task_specs {
                attempts_by_spec.insert(
                    spec.clone(),
                    self.tasks.attempts(&job.repo_state, spec).await,
                );
            }
            let borrowed: BTreeMap<String, Vec<&Task>> = attempts_by_spec
                .iter()
                .map(|(name, attempts)| (name.clone(), attempts.iter().collect()))
                .collect();
            let derived = derive_status(&job, &borrowed, self.config.budgets);
            let task_ids: BTreeMap<String, Vec<String>> = attempts_by_spec
                .iter()
                .filter(|(_, attempts)| !attempts.is_empty())
                .map(|(name, attempts)| {
                    (name.clone(), attempts.iter().map(|t| t.id.clone()).collect())
                })
                .collect();

            let desired = if derived == JobStatus::InProgress && job.status == JobStatus::Requested
            {
                // Picked up by the scheduler but no attempts yet: stay
                // requested until a member task exists.
                if task_ids.is_empty() {
                    JobStatus::Requested
                } else {
                    JobStatus::InProgress
                }
            } else {
                derived
            };
            if desired == job.status && task_ids == job.tasks {
                continue;
            }
            let result = self
                .update_job(&job.id, |j| {
                    j.status = desired;
                    j.tasks = task_ids.clone();
                    if desired.is_terminal() && j.finished.is_none() {
                        j.finished = Some(Utc::now());
                    }
                })
                .await;
            match result {
                Ok(updated) => {
                    if updated.status != job.status {
                        tracing::info!("job {} is now {:?}", updated, updated.status);
                    }
                }
                Err(e) => tracing::error!("updating job {} failed: {e}", job.id),
            }
        }
        Ok(())
    }

    // Read-modify-write with bounded CAS retries.
    async fn update_task(&self, task_id: &str, mutate: impl Fn(&mut Task)) -> Result<Task> {
        let mut attempt = 0;
        loop {
            let mut task = match self.tasks.get(task_id).await {
                Some(task) => task,
                None => self
                    .tasks
                    .store()
                    .get_task(task_id)
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        kind: "task",
                        id: task_id.to_string(),
                    })?,
            };
            mutate(&mut task);
            match self.tasks.put_task(&mut task).await {
                Ok(()) => return Ok(task),
                Err(e @ Error::ConcurrentUpdate { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.cas_attempts {
                        return Err(e);
                    }
                    tracing::debug!("retrying task update {task_id} after conflict");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn update_job(&self, job_id: &str, mutate: impl Fn(&mut Job)) -> Result<Job> {
        let mut attempt = 0;
        loop {
            let mut job = match self.jobs.get(job_id).await {
                Some(job) => job,
                None => self
                    .jobs
                    .store()
                    .get_job(job_id)
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        kind: "job",
                        id: job_id.to_string(),
                    })?,
            };
            mutate(&mut job);
            match self.jobs.put_job(&mut job).await {
                Ok(()) => return Ok(job),
                Err(e @ Error::ConcurrentUpdate { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.cas_attempts {
                        return Err(e);
                    }
                    tracing::debug!("retrying job update {job_id} after conflict");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The transitive dependency closure of `roots` within `cfg`.
fn dependency_closure(cfg: &TasksCfg, roots: &BTreeSet<String>) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
    while let Some(name) = stack.pop() {
        let Some(spec) = cfg.tasks.get(name) else {
            continue;
        };
        if closure.insert(name.to_string()) {
            stack.extend(spec.dependencies.iter().map(String::as_str));
        }
    }
    closure
}
