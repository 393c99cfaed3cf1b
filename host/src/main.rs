use std::fs::create_dir_all;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use foreman_executor::completion_channel;
use foreman_host::{pubsub, Cli, ForemanState};
use foreman_scheduler::{completion_ingress, reconcile_loop};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Cli::parse();
    opts.merge_from_file()?;
    let _guard = subscribe_log(&opts.log_path, &opts.log_level);

    let state = ForemanState::init_with(opts).await?;
    info!(
        "foreman starting: {} repos, pool {:?}",
        state.opts.repos.len(),
        state.opts.pool
    );

    let cancel = CancellationToken::new();
    let mut workers = tokio::task::JoinSet::new();

    // Skip-rule replication keeps the local view coherent with the store.
    {
        let skip_rules = state.skip_rules.clone();
        let interval = Duration::from_secs(state.opts.rules_poll_secs);
        let cancel = cancel.clone();
        workers.spawn(async move { skip_rules.replicate(interval, cancel).await });
    }

    // Completion ingress, fed by the pub/sub pull bridge when configured.
    if let Some(events_url) = state.opts.events_url.clone() {
        let (tx, rx) = completion_channel(1024);
        workers.spawn(completion_ingress(
            state.scheduler.clone(),
            rx,
            cancel.clone(),
        ));
        workers.spawn(pubsub::pull_completions(events_url, tx, cancel.clone()));
    } else {
        tracing::warn!("no --events-url: completions arrive via reconciliation only");
    }

    // Safety-net reconciliation for lost notifications.
    workers.spawn(reconcile_loop(
        state.scheduler.clone(),
        Duration::from_secs(state.opts.reconcile_interval_secs),
        cancel.clone(),
    ));

    // The scheduling loop itself.
    {
        let scheduler = state.scheduler.clone();
        let interval = Duration::from_secs(state.opts.tick_interval_secs);
        let cancel = cancel.clone();
        workers.spawn(async move { scheduler.main_loop(interval, cancel).await });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping workers");
    cancel.cancel();
    while workers.join_next().await.is_some() {}
    info!("foreman stopped");
    Ok(())
}

fn subscribe_log(log_path: &Option<PathBuf>, log_level: &str) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(env_filter);

    match log_path {
        Some(dir) => {
            if let Err(e) = create_dir_all(dir) {
                eprintln!("failed to create log dir {dir:?}: {e}");
                return None;
            }
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(EnvFilter::new("info"));
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            None
        }
    }
}
