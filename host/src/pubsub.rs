//! Bridge from the executor's completion topic to the in-process ingress
//! channel.
//!
//! The executor publishes `{taskId, userdata}` envelopes; this loop pulls
//! them from a streaming endpoint and forwards them to the scheduler's
//! completion ingress. Delivery is at-least-once end to end, which the
//! ingress handler already tolerates.

use std::time::Duration;

use foreman_executor::{CompletionEvent, CompletionSender};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Delay before reconnecting after a failed pull.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pull completion envelopes from `events_url` until cancelled.
pub async fn pull_completions(events_url: Url, tx: CompletionSender, cancel: CancellationToken) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("completion pull disabled, cannot build client: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("completion pull stopped");
                return;
            }
            batch = pull_once(&client, &events_url) => {
                match batch {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                tracing::warn!("ingress channel closed, stopping pull");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("completion pull failed: {e}, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn pull_once(client: &reqwest::Client, events_url: &Url) -> Result<Vec<CompletionEvent>, String> {
    let resp = client
        .get(events_url.clone())
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("events endpoint returned {}", resp.status()));
    }
    resp.json::<Vec<CompletionEvent>>()
        .await
        .map_err(|e| e.to_string())
}
