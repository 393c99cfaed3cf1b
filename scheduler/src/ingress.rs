use std::sync::Arc;
use std::time::Duration;

use foreman_executor::CompletionReceiver;
use tokio_util::sync::CancellationToken;

use crate::engine::Scheduler;

/// Consume executor completion notifications until cancelled.
///
/// Delivery is at-least-once, so the handler is idempotent: replays for
/// already-terminal tasks are dropped inside
/// [`Scheduler::handle_completion`].
pub async fn completion_ingress(
    scheduler: Arc<Scheduler>,
    mut events: CompletionReceiver,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("completion ingress stopped");
                return;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("completion channel closed, stopping ingress");
                    return;
                };
                tracing::debug!(
                    "completion event for {} (task {})",
                    event.executor_task_id, event.userdata
                );
                if let Err(e) = scheduler
                    .handle_completion(&event.executor_task_id, &event.userdata)
                    .await
                {
                    tracing::error!(
                        "handling completion of {} failed: {e}",
                        event.executor_task_id
                    );
                }
            }
        }
    }
}

/// Periodic safety net: reconcile non-terminal tasks whose notifications
/// may have been lost.
pub async fn reconcile_loop(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("reconcile loop stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = scheduler.reconcile().await {
                    tracing::warn!("reconcile sweep failed: {e}");
                }
            }
        }
    }
}
