use serde::{Deserialize, Serialize};

/// Identifies a pre-submit code change in a code-review system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// The code-review system hosting the change, e.g. a Gerrit base URL.
    pub code_review: String,
    pub change_id: String,
    pub patchset_id: String,
}

/// The point at which a task graph is materialized: a repository, a
/// revision on it, and optionally a pre-submit patch applied on top.
///
/// Equality is structural; RepoStates are the primary key under which task
/// configurations are cached and tasks are deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoState {
    pub repo: String,
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
}

impl RepoState {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            patch: None,
        }
    }

    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.patch = Some(patch);
        self
    }

    /// True iff this state carries a pre-submit patch.
    pub fn is_try(&self) -> bool {
        self.patch.is_some()
    }
}

impl std::fmt::Display for RepoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.patch {
            None => write!(f, "{}@{}", self.repo, self.revision),
            Some(p) => write!(
                f,
                "{}@{}+{}/{}",
                self.repo, self.revision, p.change_id, p.patchset_id
            ),
        }
    }
}
