use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use foreman_lib::{Error, RepoState, Result};
use rusqlite::{params, Connection, OpenFlags};

use crate::store::{patch_key, CfgStore, CfgValue, StoredEntry};

/// Durable sqlite-backed cold tier of the config cache.
#[derive(Debug)]
pub struct SqliteCfgStore {
    conn: Mutex<Connection>,
}

impl SqliteCfgStore {
    /// Open the store at `path`, creating it (and its schema) on first use.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let exists = path.exists();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(sql_err)?;
        Self::configure(&conn)?;
        if !exists {
            Self::create_tables(&conn)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fully in-memory store with the same schema; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::configure(&conn)?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(sql_err)?;
        conn.pragma_update(None, "temp_store", "MEMORY").map_err(sql_err)?;
        Ok(())
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cfg_cache(
                repo TEXT NOT NULL,
                revision TEXT NOT NULL,
                patch TEXT NOT NULL,
                value TEXT NOT NULL,
                commit_ts_ms INTEGER NOT NULL,
                PRIMARY KEY (repo, revision, patch)
            )",
            params![],
        )
        .map_err(sql_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS cfg_cache_by_commit_ts
                ON cfg_cache(commit_ts_ms)",
            params![],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::TransientStore(e.to_string())
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait::async_trait]
impl CfgStore for SqliteCfgStore {
    async fn get(&self, repo_state: &RepoState) -> Result<Option<StoredEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(
                "SELECT value, commit_ts_ms FROM cfg_cache
                    WHERE repo = ?1 AND revision = ?2 AND patch = ?3",
            )
            .map_err(sql_err)?;
        let row: Option<(String, i64)> = stmt
            .query_row(
                params![repo_state.repo, repo_state.revision, patch_key(repo_state)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sql_err(other)),
            })?;
        match row {
            None => Ok(None),
            Some((value_json, ts_ms)) => {
                let value: CfgValue = serde_json::from_str(&value_json)?;
                Ok(Some(StoredEntry {
                    repo_state: repo_state.clone(),
                    value,
                    commit_ts: ms_to_utc(ts_ms),
                }))
            }
        }
    }

    async fn put(&self, entry: StoredEntry) -> Result<()> {
        let value_json = serde_json::to_string(&entry.value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cfg_cache(repo, revision, patch, value, commit_ts_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(repo, revision, patch) DO UPDATE
                    SET value = excluded.value, commit_ts_ms = excluded.commit_ts_ms",
            params![
                entry.repo_state.repo,
                entry.repo_state.revision,
                patch_key(&entry.repo_state),
                value_json,
                entry.commit_ts.timestamp_millis(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM cfg_cache WHERE commit_ts_ms < ?1",
            params![cutoff.timestamp_millis()],
        )
        .map_err(sql_err)
    }
}
