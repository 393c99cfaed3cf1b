use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreman_lib::{Error, IdGenerator, Job, Result, Task};

use crate::{next_stamp, RecordStore};

/// In-memory [`RecordStore`] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    jobs: HashMap<String, Job>,
    ids: IdGenerator,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemStore {
    async fn put_tasks(&self, tasks: &mut [Task]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        // Validate the whole batch before mutating anything.
        for task in tasks.iter() {
            if let Some(stored) = inner.tasks.get(&task.id) {
                if stored.db_modified > task.db_modified {
                    return Err(Error::ConcurrentUpdate {
                        kind: "task",
                        id: task.id.clone(),
                    });
                }
            }
        }
        for task in tasks.iter_mut() {
            if task.id.is_empty() {
                task.id = inner.ids.next(now);
                task.created = now;
            }
            let stored = inner.tasks.get(&task.id).map(|t| t.db_modified);
            task.db_modified = next_stamp(stored, now);
            inner.tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.inner.lock().unwrap().tasks.get(id).cloned())
    }

    async fn get_tasks_created_after(&self, start: DateTime<Utc>) -> Result<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.created >= start)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn put_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for job in jobs.iter() {
            if let Some(stored) = inner.jobs.get(&job.id) {
                if stored.db_modified > job.db_modified {
                    return Err(Error::ConcurrentUpdate {
                        kind: "job",
                        id: job.id.clone(),
                    });
                }
            }
        }
        for job in jobs.iter_mut() {
            if job.id.is_empty() {
                job.id = inner.ids.next(now);
                job.created = now;
            }
            let stored = inner.jobs.get(&job.id).map(|j| j.db_modified);
            job.db_modified = next_stamp(stored, now);
            inner.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(id).cloned())
    }

    async fn get_jobs_created_after(&self, start: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.created >= start)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }
}
