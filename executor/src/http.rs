use std::time::Duration;

use foreman_lib::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::types::{ExecutorTaskStatus, Machine, TaskRequest, TaskResult};
use crate::Executor;

/// Transient calls are retried this many times before giving up.
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// JSON-over-HTTP client for the execution service.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::TransientExecutor(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Validation(format!("bad executor url path {path:?}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        self.with_retries(|| async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| Error::TransientExecutor(e.to_string()))?;
            Self::decode(resp).await
        })
        .await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path)?;
        self.with_retries(|| async {
            let resp = self
                .client
                .post(url.clone())
                .json(body)
                .send()
                .await
                .map_err(|e| Error::TransientExecutor(e.to_string()))?;
            Self::decode(resp).await
        })
        .await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TransientExecutor(format!(
                "executor returned {status}: {body}"
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::TransientExecutor(format!("undecodable executor response: {e}")))
    }

    async fn with_retries<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!("executor call failed (attempt {attempt}/{MAX_ATTEMPTS}): {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait::async_trait]
impl Executor for HttpExecutor {
    async fn get_free_machines(&self, pool: &str) -> Result<Vec<Machine>> {
        let machines: Vec<Machine> = self.get_json(&format!("machines?pool={pool}")).await?;
        Ok(machines.into_iter().filter(Machine::is_free).collect())
    }

    async fn get_pending_tasks(&self, pool: &str) -> Result<Vec<TaskResult>> {
        self.get_json(&format!("tasks/pending?pool={pool}")).await
    }

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResult> {
        self.get_json(&format!("tasks/{task_id}")).await
    }

    async fn get_task_completion_statuses(&self, task_ids: &[String]) -> Result<Vec<bool>> {
        self.post_json("tasks/completed", task_ids).await
    }

    async fn trigger_task(&self, request: &TaskRequest) -> Result<TaskResult> {
        let result: TaskResult = self.post_json("tasks/new", request).await?;
        if result.status == ExecutorTaskStatus::NoResource {
            return Err(Error::NoResource(request.dimensions.clone()));
        }
        Ok(result)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(&format!("tasks/{task_id}/cancel"), &serde_json::json!({}))
            .await?;
        Ok(())
    }
}
