use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use foreman_lib::Patch;

/// Conventional path of the task configuration file inside a repository.
pub const TASKS_CFG_FILE: &str = "infra/bots/tasks.json";

/// Errors from repository content reads.
#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    /// The network or the git server misbehaved; worth retrying.
    #[error("transient repo error: {0}")]
    Transient(String),

    /// The patch does not apply cleanly to its base revision. Permanent.
    #[error("patch failed to merge: {0}")]
    MergeConflict(String),

    /// The requested file does not exist at the revision. Permanent.
    #[error("file not found: {repo}@{revision}:{path}")]
    FileMissing {
        repo: String,
        revision: String,
        path: String,
    },

    #[error("unknown commit {hash} in {repo}")]
    UnknownCommit { repo: String, hash: String },
}

impl RepoError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Transient(_))
    }
}

/// Capability for reading file content out of a repository, optionally
/// with a pre-submit patch applied.
///
/// Implementations may suspend (network); callers treat any call as a
/// suspension point.
#[async_trait::async_trait]
pub trait RepoClient: Send + Sync {
    /// Read `path` at `revision`.
    async fn read_file(&self, repo: &str, revision: &str, path: &str) -> Result<Vec<u8>, RepoError>;

    /// Apply `patch` onto `revision` and read `path` from the result.
    /// A merge conflict is a permanent [`RepoError::MergeConflict`].
    async fn apply_patch_and_read(
        &self,
        repo: &str,
        revision: &str,
        patch: &Patch,
        path: &str,
    ) -> Result<Vec<u8>, RepoError>;
}

/// Gitiles-style HTTP content client.
///
/// Post-submit reads fetch `<repo>/+/<revision>/<path>?format=TEXT`
/// (base64-encoded body). Pre-submit reads fetch the patched file from the
/// code-review system's revision content API; the review system performs
/// the merge and reports conflicts with 409.
#[derive(Debug, Clone)]
pub struct HttpRepoClient {
    client: reqwest::Client,
}

impl HttpRepoClient {
    pub fn new(timeout: Duration) -> Result<Self, RepoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepoError::Transient(e.to_string()))?;
        Ok(Self { client })
    }

    async fn fetch_base64(&self, url: &str) -> Result<Vec<u8>, RepoError> {
        tracing::debug!("fetching {url}");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RepoError::Transient(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RepoError::FileMissing {
                repo: url.to_string(),
                revision: String::new(),
                path: String::new(),
            });
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Err(RepoError::MergeConflict(format!("{url} returned 409")));
        }
        if !status.is_success() {
            return Err(RepoError::Transient(format!("{url} returned {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| RepoError::Transient(e.to_string()))?;
        general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| RepoError::Transient(format!("invalid base64 from {url}: {e}")))
    }
}

#[async_trait::async_trait]
impl RepoClient for HttpRepoClient {
    async fn read_file(&self, repo: &str, revision: &str, path: &str) -> Result<Vec<u8>, RepoError> {
        let url = format!("{repo}/+/{revision}/{path}?format=TEXT");
        self.fetch_base64(&url).await.map_err(|e| match e {
            RepoError::FileMissing { .. } => RepoError::FileMissing {
                repo: repo.to_string(),
                revision: revision.to_string(),
                path: path.to_string(),
            },
            other => other,
        })
    }

    async fn apply_patch_and_read(
        &self,
        repo: &str,
        revision: &str,
        patch: &Patch,
        path: &str,
    ) -> Result<Vec<u8>, RepoError> {
        let encoded_path = path.replace('/', "%2F");
        let url = format!(
            "{}/changes/{}/revisions/{}/files/{}/content?base={}",
            patch.code_review, patch.change_id, patch.patchset_id, encoded_path, revision
        );
        self.fetch_base64(&url).await.map_err(|e| match e {
            RepoError::FileMissing { .. } => RepoError::FileMissing {
                repo: repo.to_string(),
                revision: revision.to_string(),
                path: path.to_string(),
            },
            other => other,
        })
    }
}

type FileKey = (String, String, String);

/// In-memory [`RepoClient`] for tests.
///
/// Patched content is keyed by `(change_id, patchset_id, path)`; a patch
/// registered as conflicting fails every read with a merge conflict. Reads
/// are counted so tests can assert on caching behavior.
#[derive(Debug, Default)]
pub struct InMemoryRepoClient {
    files: Mutex<HashMap<FileKey, Vec<u8>>>,
    patched: Mutex<HashMap<FileKey, Vec<u8>>>,
    conflicts: Mutex<HashMap<(String, String), String>>,
    reads: Mutex<u64>,
}

impl InMemoryRepoClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, repo: &str, revision: &str, path: &str, content: &[u8]) {
        self.files.lock().unwrap().insert(
            (repo.to_string(), revision.to_string(), path.to_string()),
            content.to_vec(),
        );
    }

    pub fn put_patched_file(&self, patch: &Patch, path: &str, content: &[u8]) {
        self.patched.lock().unwrap().insert(
            (
                patch.change_id.clone(),
                patch.patchset_id.clone(),
                path.to_string(),
            ),
            content.to_vec(),
        );
    }

    /// Make every read through `patch` fail with a merge conflict.
    pub fn set_conflict(&self, patch: &Patch, message: &str) {
        self.conflicts.lock().unwrap().insert(
            (patch.change_id.clone(), patch.patchset_id.clone()),
            message.to_string(),
        );
    }

    /// Number of reads served, including failed ones.
    pub fn read_count(&self) -> u64 {
        *self.reads.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl RepoClient for InMemoryRepoClient {
    async fn read_file(&self, repo: &str, revision: &str, path: &str) -> Result<Vec<u8>, RepoError> {
        *self.reads.lock().unwrap() += 1;
        self.files
            .lock()
            .unwrap()
            .get(&(repo.to_string(), revision.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| RepoError::FileMissing {
                repo: repo.to_string(),
                revision: revision.to_string(),
                path: path.to_string(),
            })
    }

    async fn apply_patch_and_read(
        &self,
        repo: &str,
        revision: &str,
        patch: &Patch,
        path: &str,
    ) -> Result<Vec<u8>, RepoError> {
        *self.reads.lock().unwrap() += 1;
        let conflict_key = (patch.change_id.clone(), patch.patchset_id.clone());
        if let Some(message) = self.conflicts.lock().unwrap().get(&conflict_key) {
            return Err(RepoError::MergeConflict(message.clone()));
        }
        self.patched
            .lock()
            .unwrap()
            .get(&(
                patch.change_id.clone(),
                patch.patchset_id.clone(),
                path.to_string(),
            ))
            .cloned()
            .ok_or_else(|| RepoError::FileMissing {
                repo: repo.to_string(),
                revision: revision.to_string(),
                path: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch() -> Patch {
        Patch {
            code_review: "https://review.example.com".into(),
            change_id: "1234".into(),
            patchset_id: "2".into(),
        }
    }

    #[tokio::test]
    async fn in_memory_client_serves_files() {
        let client = InMemoryRepoClient::new();
        client.put_file("repo", "abc", TASKS_CFG_FILE, b"{}");
        let content = client.read_file("repo", "abc", TASKS_CFG_FILE).await.unwrap();
        assert_eq!(content, b"{}");
        assert_eq!(client.read_count(), 1);

        let err = client.read_file("repo", "def", TASKS_CFG_FILE).await.unwrap_err();
        assert!(matches!(err, RepoError::FileMissing { .. }));
    }

    #[tokio::test]
    async fn in_memory_client_applies_patches() {
        let client = InMemoryRepoClient::new();
        let p = patch();
        client.put_patched_file(&p, TASKS_CFG_FILE, b"patched");
        let content = client
            .apply_patch_and_read("repo", "abc", &p, TASKS_CFG_FILE)
            .await
            .unwrap();
        assert_eq!(content, b"patched");
    }

    #[tokio::test]
    async fn conflicting_patch_is_a_merge_conflict() {
        let client = InMemoryRepoClient::new();
        let p = patch();
        client.put_patched_file(&p, TASKS_CFG_FILE, b"patched");
        client.set_conflict(&p, "conflict in tasks.json");
        let err = client
            .apply_patch_and_read("repo", "abc", &p, TASKS_CFG_FILE)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::MergeConflict(_)));
        assert!(!err.is_transient());
    }
}
