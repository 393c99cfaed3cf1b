//! # Foreman host
//!
//! Process entrypoint wiring the scheduler core together: configuration
//! (CLI merged over a JSON config file), logging, the durable stores, the
//! executor client, the skip-rule replication, and the background loops.
//!
//! There is deliberately no HTTP surface here; operators interact through
//! the config file and the shared stores.

pub mod pubsub;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use clap::Parser;
use foreman_cfgcache::{SqliteCfgStore, TasksCfgCache};
use foreman_executor::HttpExecutor;
use foreman_lib::RetryBudgets;
use foreman_repograph::{Commit, HttpRepoClient, RepoGraph, RepoMap};
use foreman_scheduler::{Scheduler, SchedulerConfig};
use foreman_skiprules::{InMemoryRuleStore, RedisRuleStore, SkipRuleStore, SkipRules};
use foreman_taskdb::{JobCache, SqliteStore, TaskCache};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

fn default_config_path() -> PathBuf {
    PathBuf::from("config/foreman.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_task_db() -> PathBuf {
    PathBuf::from("foreman-tasks.sqlite")
}

fn default_cfg_db() -> PathBuf {
    PathBuf::from("foreman-cfgs.sqlite")
}

fn default_pool() -> String {
    "default".to_string()
}

fn default_tick_interval() -> u64 {
    5
}

fn default_window_hours() -> i64 {
    24
}

fn default_window_min_commits() -> usize {
    5
}

fn default_rules_poll() -> u64 {
    10
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Parser)]
#[command(name = "foreman", about = "CI task scheduler", long_about = None)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "config/foreman.json")]
    #[serde(default = "default_config_path")]
    /// Path to a JSON config file; command-line flags win over its values.
    pub config_path: PathBuf,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[arg(long, require_equals = true)]
    /// Directory for rotating JSON log files; stdout only when unset.
    pub log_path: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "foreman-tasks.sqlite")]
    #[serde(default = "default_task_db")]
    /// Durable task/job record store.
    pub task_db_path: PathBuf,

    #[arg(long, require_equals = true, default_value = "foreman-cfgs.sqlite")]
    #[serde(default = "default_cfg_db")]
    /// Cold tier of the task-config cache.
    pub cfg_db_path: PathBuf,

    #[arg(long, require_equals = true)]
    /// Redis holding the shared skip-rule set; in-memory (process-local)
    /// rules when unset.
    pub redis_url: Option<String>,

    #[arg(long, require_equals = true)]
    /// Base URL of the execution service.
    pub executor_url: Option<Url>,

    #[arg(long, require_equals = true)]
    /// Completion event stream endpoint (pub/sub pull bridge); the
    /// reconcile sweep is the only completion path when unset.
    pub events_url: Option<Url>,

    #[arg(long, require_equals = true, default_value = "default")]
    #[serde(default = "default_pool")]
    /// Machine pool tasks are dispatched to.
    pub pool: String,

    #[arg(long = "repo", require_equals = true)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    /// Watched repositories (repeatable).
    pub repos: Vec<String>,

    #[arg(long, require_equals = true)]
    /// Optional JSON snapshot of the watched repos' commit DAGs, as
    /// produced by the ingestion job.
    pub repo_snapshot: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "5")]
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[arg(long, require_equals = true, default_value = "24")]
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,

    #[arg(long, require_equals = true, default_value = "5")]
    #[serde(default = "default_window_min_commits")]
    pub window_min_commits: usize,

    #[arg(long, require_equals = true, default_value = "10")]
    #[serde(default = "default_rules_poll")]
    pub rules_poll_secs: u64,

    #[arg(long, require_equals = true, default_value = "60")]
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[arg(long, require_equals = true, default_value = "60")]
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Cli {
    /// Read the config file and merge it under the current options:
    /// values from the command line win.
    pub fn merge_from_file(&mut self) -> Result<()> {
        let file = match std::fs::File::open(&self.config_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file at {:?}, using flags only", self.config_path);
                return Ok(());
            }
            Err(e) => return Err(e).context("opening config file"),
        };
        let reader = std::io::BufReader::new(file);
        let mut config: Value = serde_json::from_reader(reader).context("parsing config file")?;
        let this = serde_json::to_value(&self)?;
        merge(&mut config, &this);
        *self = serde_json::from_value(config).context("merging config file")?;
        Ok(())
    }
}

/// Merge two JSON trees, overwriting `a` with the non-null values of `b`.
fn merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                merge(a.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (a, b) if !b.is_null() => *a = b.clone(),
        _ => {}
    }
}

/// Snapshot file shape: repo url -> commits.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RepoSnapshot(pub std::collections::BTreeMap<String, Vec<Commit>>);

/// Everything the process runs: the scheduler plus the handles its
/// background loops need.
pub struct ForemanState {
    pub opts: Cli,
    pub repos: Arc<RwLock<RepoMap>>,
    pub scheduler: Arc<Scheduler>,
    pub skip_rules: SkipRules,
}

impl ForemanState {
    pub async fn init_with(opts: Cli) -> Result<Self> {
        let timeout = StdDuration::from_secs(opts.http_timeout_secs);

        let mut map = RepoMap::new();
        for repo in &opts.repos {
            map.insert(RepoGraph::new(repo.clone()));
        }
        if let Some(path) = &opts.repo_snapshot {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening repo snapshot {path:?}"))?;
            let snapshot: RepoSnapshot =
                serde_json::from_reader(std::io::BufReader::new(file))
                    .context("parsing repo snapshot")?;
            for (repo, commits) in snapshot.0 {
                let graph = match map.get_mut(&repo) {
                    Some(graph) => graph,
                    None => {
                        map.insert(RepoGraph::new(repo.clone()));
                        map.get_mut(&repo).expect("just inserted")
                    }
                };
                for commit in commits {
                    graph.insert(commit);
                }
            }
        }
        let repos = Arc::new(RwLock::new(map));

        let repo_client =
            Arc::new(HttpRepoClient::new(timeout).map_err(|e| anyhow::anyhow!("{e}"))?);
        let cfg_store = Arc::new(
            SqliteCfgStore::open_or_create(&opts.cfg_db_path)
                .map_err(|e| anyhow::anyhow!("opening config cache store: {e}"))?,
        );
        let cfg_cache = Arc::new(TasksCfgCache::new(repo_client, cfg_store));

        let rule_store: Arc<dyn SkipRuleStore> = match &opts.redis_url {
            Some(redis_url) => Arc::new(
                RedisRuleStore::open(redis_url.clone())
                    .map_err(|e| anyhow::anyhow!("opening skip-rule store: {e}"))?,
            ),
            None => {
                tracing::warn!("no --redis-url: skip rules are process-local");
                Arc::new(InMemoryRuleStore::new())
            }
        };
        let skip_rules = SkipRules::new(rule_store);
        skip_rules
            .update()
            .await
            .map_err(|e| anyhow::anyhow!("initial skip-rule sync: {e}"))?;

        let record_store = Arc::new(
            SqliteStore::open_or_create(&opts.task_db_path)
                .map_err(|e| anyhow::anyhow!("opening task store: {e}"))?,
        );
        let tasks = Arc::new(TaskCache::new(record_store.clone()));
        let jobs = Arc::new(JobCache::new(record_store));

        let executor_url = opts
            .executor_url
            .clone()
            .context("--executor-url is required")?;
        let executor = Arc::new(
            HttpExecutor::new(executor_url, timeout).map_err(|e| anyhow::anyhow!("{e}"))?,
        );

        let config = SchedulerConfig {
            pool: opts.pool.clone(),
            window_duration: chrono::Duration::hours(opts.window_hours),
            window_min_commits: opts.window_min_commits,
            budgets: RetryBudgets::default(),
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            repos.clone(),
            cfg_cache,
            skip_rules.clone(),
            tasks,
            jobs,
            executor,
            config,
        ));
        scheduler
            .rebuild_caches()
            .await
            .map_err(|e| anyhow::anyhow!("rebuilding caches: {e}"))?;

        Ok(Self {
            opts,
            repos,
            scheduler,
            skip_rules,
        })
    }
}
