use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use foreman_lib::{Job, RepoState, Result, Task};
use tokio::sync::Mutex;

use crate::RecordStore;

/// Window-scoped in-memory index over the tasks in a [`RecordStore`]
/// (component F).
///
/// All mutations are write-through: the store performs the CAS check and
/// stamps the records, then the indexes are updated under the cache mutex.
pub struct TaskCache {
    store: Arc<dyn RecordStore>,
    inner: Mutex<TaskIndex>,
}

#[derive(Default)]
struct TaskIndex {
    by_id: HashMap<String, Task>,
    by_repo_state: HashMap<RepoState, HashSet<String>>,
    /// Task IDs by `(repo, blamed commit)`; a task appears under every
    /// commit in its blame list. This is the index blame computation walks.
    by_commit: HashMap<(String, String), HashSet<String>>,
    unfinished: HashSet<String>,
}

impl TaskIndex {
    fn insert(&mut self, task: Task) {
        self.remove(&task.id);
        self.by_repo_state
            .entry(task.repo_state.clone())
            .or_default()
            .insert(task.id.clone());
        for commit in &task.commits {
            self.by_commit
                .entry((task.repo_state.repo.clone(), commit.clone()))
                .or_default()
                .insert(task.id.clone());
        }
        if !task.is_terminal() {
            self.unfinished.insert(task.id.clone());
        }
        self.by_id.insert(task.id.clone(), task);
    }

    fn remove(&mut self, id: &str) {
        let Some(old) = self.by_id.remove(id) else {
            return;
        };
        if let Some(ids) = self.by_repo_state.get_mut(&old.repo_state) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_repo_state.remove(&old.repo_state);
            }
        }
        for commit in &old.commits {
            let key = (old.repo_state.repo.clone(), commit.clone());
            if let Some(ids) = self.by_commit.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_commit.remove(&key);
                }
            }
        }
        self.unfinished.remove(id);
    }
}

impl TaskCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(TaskIndex::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Drop the in-memory index and restream every task created at or
    /// after `start` from the store.
    pub async fn rebuild(&self, start: DateTime<Utc>) -> Result<()> {
        let tasks = self.store.get_tasks_created_after(start).await?;
        let mut inner = self.inner.lock().await;
        *inner = TaskIndex::default();
        let count = tasks.len();
        for task in tasks {
            inner.insert(task);
        }
        tracing::info!("task cache rebuilt with {count} tasks");
        Ok(())
    }

    /// Write tasks through to the store, then index the stored copies.
    pub async fn put_tasks(&self, tasks: &mut [Task]) -> Result<()> {
        self.store.put_tasks(tasks).await?;
        let mut inner = self.inner.lock().await;
        for task in tasks.iter() {
            inner.insert(task.clone());
        }
        Ok(())
    }

    pub async fn put_task(&self, task: &mut Task) -> Result<()> {
        self.put_tasks(std::slice::from_mut(task)).await
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().await.by_id.get(id).cloned()
    }

    /// All cached tasks at a RepoState, any spec.
    pub async fn tasks_for_repo_state(&self, repo_state: &RepoState) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .by_repo_state
            .get(repo_state)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Attempts of `name` at a RepoState, oldest first.
    pub async fn attempts(&self, repo_state: &RepoState, name: &str) -> Vec<Task> {
        let mut tasks = self.tasks_for_repo_state(repo_state).await;
        tasks.retain(|t| t.name == name);
        tasks
    }

    /// All cached tasks whose blame list contains `(repo, commit)`.
    pub async fn tasks_for_commit(&self, repo: &str, commit: &str) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .by_commit
            .get(&(repo.to_string(), commit.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Whether a successful run of `name` already speaks for
    /// `(repo, commit)`. Blame-list walks stop at such commits.
    pub async fn has_success_covering(&self, repo: &str, commit: &str, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .by_commit
            .get(&(repo.to_string(), commit.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id))
            .any(|t| t.name == name && t.status == foreman_lib::TaskStatus::Success)
    }

    pub async fn unfinished(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .unfinished
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Evict tasks whose RepoState fell out of the window. The predicate
    /// receives each task's RepoState and returns whether it is still
    /// inside. Durable records are untouched.
    pub async fn expire(&self, in_window: impl Fn(&RepoState) -> bool) {
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .by_id
            .values()
            .filter(|t| !in_window(&t.repo_state))
            .map(|t| t.id.clone())
            .collect();
        let count = stale.len();
        for id in stale {
            inner.remove(&id);
        }
        if count > 0 {
            tracing::debug!("task cache expired {count} tasks");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Window-scoped in-memory index over the jobs in a [`RecordStore`].
pub struct JobCache {
    store: Arc<dyn RecordStore>,
    inner: Mutex<JobIndex>,
}

#[derive(Default)]
struct JobIndex {
    by_id: HashMap<String, Job>,
    by_key: HashMap<(RepoState, String), HashSet<String>>,
    unfinished: HashSet<String>,
}

impl JobIndex {
    fn insert(&mut self, job: Job) {
        self.remove(&job.id);
        self.by_key
            .entry((job.repo_state.clone(), job.name.clone()))
            .or_default()
            .insert(job.id.clone());
        if !job.is_terminal() {
            self.unfinished.insert(job.id.clone());
        }
        self.by_id.insert(job.id.clone(), job);
    }

    fn remove(&mut self, id: &str) {
        let Some(old) = self.by_id.remove(id) else {
            return;
        };
        let key = (old.repo_state.clone(), old.name.clone());
        if let Some(ids) = self.by_key.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_key.remove(&key);
            }
        }
        self.unfinished.remove(id);
    }
}

impl JobCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(JobIndex::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn rebuild(&self, start: DateTime<Utc>) -> Result<()> {
        let jobs = self.store.get_jobs_created_after(start).await?;
        let mut inner = self.inner.lock().await;
        *inner = JobIndex::default();
        let count = jobs.len();
        for job in jobs {
            inner.insert(job);
        }
        tracing::info!("job cache rebuilt with {count} jobs");
        Ok(())
    }

    pub async fn put_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        self.store.put_jobs(jobs).await?;
        let mut inner = self.inner.lock().await;
        for job in jobs.iter() {
            inner.insert(job.clone());
        }
        Ok(())
    }

    pub async fn put_job(&self, job: &mut Job) -> Result<()> {
        self.put_jobs(std::slice::from_mut(job)).await
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.lock().await.by_id.get(id).cloned()
    }

    /// Jobs for `(RepoState, job name)`, oldest first.
    pub async fn jobs_for(&self, repo_state: &RepoState, name: &str) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .by_key
            .get(&(repo_state.clone(), name.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn unfinished(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .unfinished
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn expire(&self, in_window: impl Fn(&RepoState) -> bool) {
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .by_id
            .values()
            .filter(|j| !in_window(&j.repo_state))
            .map(|j| j.id.clone())
            .collect();
        for id in stale {
            inner.remove(&id);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use foreman_lib::TaskStatus;
    use pretty_assertions::assert_eq;

    fn repo_state(rev: &str) -> RepoState {
        RepoState::new("repo", rev)
    }

    fn task(rev: &str, name: &str, commits: &[&str]) -> Task {
        Task {
            commits: commits.iter().map(|c| c.to_string()).collect(),
            ..Task::new(repo_state(rev), name)
        }
    }

    async fn cache() -> TaskCache {
        TaskCache::new(Arc::new(MemStore::new()))
    }

    #[tokio::test]
    async fn indexes_by_repo_state_and_blamed_commit() {
        let cache = cache().await;
        let mut t = task("c", "Build", &["c", "b"]);
        cache.put_task(&mut t).await.unwrap();

        assert_eq!(cache.tasks_for_repo_state(&repo_state("c")).await.len(), 1);
        assert_eq!(cache.tasks_for_commit("repo", "b").await.len(), 1);
        assert_eq!(cache.tasks_for_commit("repo", "c").await.len(), 1);
        assert!(cache.tasks_for_commit("repo", "a").await.is_empty());
        assert_eq!(cache.get(&t.id).await.unwrap().name, "Build");
    }

    #[tokio::test]
    async fn success_coverage_is_per_spec() {
        let cache = cache().await;
        let mut build = task("b", "Build", &["b", "a"]);
        build.status = TaskStatus::Success;
        cache.put_task(&mut build).await.unwrap();

        assert!(cache.has_success_covering("repo", "a", "Build").await);
        assert!(cache.has_success_covering("repo", "b", "Build").await);
        assert!(!cache.has_success_covering("repo", "a", "Test").await);
        assert!(!cache.has_success_covering("repo", "c", "Build").await);
    }

    #[tokio::test]
    async fn status_updates_move_tasks_out_of_unfinished() {
        let cache = cache().await;
        let mut t = task("a", "Build", &["a"]);
        cache.put_task(&mut t).await.unwrap();
        assert_eq!(cache.unfinished().await.len(), 1);

        t.status = TaskStatus::Success;
        cache.put_task(&mut t).await.unwrap();
        assert!(cache.unfinished().await.is_empty());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn expire_drops_out_of_window_tasks_but_not_durable_records() {
        let cache = cache().await;
        let mut old = task("old", "Build", &["old"]);
        let mut new = task("new", "Build", &["new"]);
        cache.put_task(&mut old).await.unwrap();
        cache.put_task(&mut new).await.unwrap();

        cache.expire(|rs| rs.revision == "new").await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&old.id).await.is_none());
        // Durable record is still there.
        assert!(cache.store().get_task(&old.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rebuild_restores_indexes_from_store() {
        let store = Arc::new(MemStore::new());
        {
            let cache = TaskCache::new(store.clone());
            let mut t = task("c", "Build", &["c", "b"]);
            t.status = TaskStatus::Success;
            cache.put_task(&mut t).await.unwrap();
        }
        let cache = TaskCache::new(store);
        assert!(cache.is_empty().await);
        cache.rebuild(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert!(cache.has_success_covering("repo", "b", "Build").await);
    }

    #[tokio::test]
    async fn job_cache_tracks_unfinished_jobs() {
        let job_cache = JobCache::new(Arc::new(MemStore::new()));
        let mut job = Job::new(repo_state("a"), "BuildAll", vec!["Build".into()]);
        job_cache.put_job(&mut job).await.unwrap();
        assert_eq!(job_cache.unfinished().await.len(), 1);
        assert_eq!(job_cache.jobs_for(&repo_state("a"), "BuildAll").await.len(), 1);

        job.status = foreman_lib::JobStatus::Success;
        job_cache.put_job(&mut job).await.unwrap();
        assert!(job_cache.unfinished().await.is_empty());
        assert_eq!(job_cache.len().await, 1);
    }
}
