use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreman_lib::{Error, IdGenerator, Job, Result, Task};
use rusqlite::{params, Connection, OpenFlags};

use crate::{next_stamp, RecordStore};

/// Durable sqlite-backed [`RecordStore`].
///
/// Records are stored as JSON payloads beside the columns the store needs
/// for its own queries (id, creation time, CAS stamp); everything else is
/// opaque to sqlite.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    ids: IdGenerator,
}

impl SqliteStore {
    /// Open the store at `path`, creating it (and its schema) on first use.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(sql_err)?;
        Self::init(conn)
    }

    /// Fully in-memory store with the same schema; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(sql_err)?;
        conn.pragma_update(None, "temp_store", "MEMORY").map_err(sql_err)?;
        for table in ["tasks", "jobs"] {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table}(
                        id TEXT PRIMARY KEY NOT NULL,
                        created_ms INTEGER NOT NULL,
                        db_modified_ms INTEGER NOT NULL,
                        data TEXT NOT NULL
                    )"
                ),
                params![],
            )
            .map_err(sql_err)?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {table}_by_created
                        ON {table}(created_ms)"
                ),
                params![],
            )
            .map_err(sql_err)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            ids: IdGenerator::new(),
        })
    }
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::TransientStore(e.to_string())
}

// The task/job put paths are identical except for types; this macro keeps
// the CAS discipline in one place.
macro_rules! put_records {
    ($self:ident, $records:ident, $table:literal, $kind:literal) => {{
        let mut conn = $self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(sql_err)?;
        let now = Utc::now();
        for record in $records.iter_mut() {
            if record.id.is_empty() {
                record.id = $self.ids.next(now);
                record.created = now;
            }
            let stored_ms: Option<i64> = tx
                .query_row(
                    concat!("SELECT db_modified_ms FROM ", $table, " WHERE id = ?1"),
                    params![record.id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(sql_err(other)),
                })?;
            if let Some(stored_ms) = stored_ms {
                if stored_ms > record.db_modified.timestamp_millis() {
                    // Dropping the transaction rolls back the batch.
                    return Err(Error::ConcurrentUpdate {
                        kind: $kind,
                        id: record.id.clone(),
                    });
                }
            }
            let stored = stored_ms.and_then(|ms| chrono::TimeZone::timestamp_millis_opt(&Utc, ms).single());
            record.db_modified = next_stamp(stored, now);
            let data = serde_json::to_string(&record)?;
            tx.execute(
                concat!(
                    "INSERT OR REPLACE INTO ",
                    $table,
                    "(id, created_ms, db_modified_ms, data) VALUES (?1, ?2, ?3, ?4)"
                ),
                params![
                    record.id,
                    record.created.timestamp_millis(),
                    record.db_modified.timestamp_millis(),
                    data
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }};
}

macro_rules! get_record {
    ($self:ident, $id:ident, $table:literal, $ty:ty) => {{
        let conn = $self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                concat!("SELECT data FROM ", $table, " WHERE id = ?1"),
                params![$id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sql_err(other)),
            })?;
        match data {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str::<$ty>(&json)?)),
        }
    }};
}

macro_rules! get_created_after {
    ($self:ident, $start:ident, $table:literal, $ty:ty) => {{
        let conn = $self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(concat!(
                "SELECT data FROM ",
                $table,
                " WHERE created_ms >= ?1 ORDER BY id"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![$start.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(sql_err)?;
        let mut records = Vec::new();
        for row in rows {
            let json = row.map_err(sql_err)?;
            records.push(serde_json::from_str::<$ty>(&json)?);
        }
        Ok(records)
    }};
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    async fn put_tasks(&self, tasks: &mut [Task]) -> Result<()> {
        put_records!(self, tasks, "tasks", "task")
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        get_record!(self, id, "tasks", Task)
    }

    async fn get_tasks_created_after(&self, start: DateTime<Utc>) -> Result<Vec<Task>> {
        get_created_after!(self, start, "tasks", Task)
    }

    async fn put_jobs(&self, jobs: &mut [Job]) -> Result<()> {
        put_records!(self, jobs, "jobs", "job")
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        get_record!(self, id, "jobs", Job)
    }

    async fn get_jobs_created_after(&self, start: DateTime<Utc>) -> Result<Vec<Job>> {
        get_created_after!(self, start, "jobs", Job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_lib::{JobStatus, RepoState, TaskStatus};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn task(name: &str) -> Task {
        Task::new(RepoState::new("repo", "abc"), name)
    }

    #[tokio::test]
    async fn tasks_round_trip_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tasks = vec![task("Build"), task("Test")];
        store.put_tasks(&mut tasks).await.unwrap();
        let got = store.get_task(&tasks[1].id).await.unwrap().unwrap();
        assert_eq!(got.name, "Test");
        assert_eq!(got.repo_state, tasks[1].repo_state);
    }

    #[tokio::test]
    async fn cas_rejects_stale_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tasks = vec![task("Build")];
        store.put_tasks(&mut tasks).await.unwrap();

        let mut stale = store.get_task(&tasks[0].id).await.unwrap().unwrap();
        let mut fresh = stale.clone();
        fresh.status = TaskStatus::Running;
        store.put_tasks(std::slice::from_mut(&mut fresh)).await.unwrap();

        stale.status = TaskStatus::Canceled;
        let err = store
            .put_tasks(std::slice::from_mut(&mut stale))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdate { .. }));
        // The failed write must not have clobbered the fresh one.
        assert_eq!(
            store.get_task(&fresh.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.sqlite");
        let id = {
            let store = SqliteStore::open_or_create(&path).unwrap();
            let mut tasks = vec![task("Build")];
            store.put_tasks(&mut tasks).await.unwrap();
            tasks[0].id.clone()
        };
        let store = SqliteStore::open_or_create(&path).unwrap();
        assert!(store.get_task(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn jobs_round_trip_and_stream() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut jobs = vec![Job::new(
            RepoState::new("repo", "abc"),
            "BuildAll",
            vec!["Build".into()],
        )];
        store.put_jobs(&mut jobs).await.unwrap();
        let got = store.get_job(&jobs[0].id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Requested);

        let streamed = store
            .get_jobs_created_after(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(streamed.len(), 1);
    }
}
