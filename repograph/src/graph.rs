use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::RepoError;

/// One commit in a repository snapshot.
///
/// `parents[0]` is the first parent; first-parent ancestry defines the
/// primary branch history that blame lists and windows walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub author: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    pub fn first_parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }
}

/// Snapshot of one repository's commit DAG.
#[derive(Debug, Clone, Default)]
pub struct RepoGraph {
    repo: String,
    commits: HashMap<String, Commit>,
}

impl RepoGraph {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            commits: HashMap::new(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Insert or replace a commit in the snapshot.
    pub fn insert(&mut self, commit: Commit) {
        self.commits.insert(commit.hash.clone(), commit);
    }

    pub fn get(&self, hash: &str) -> Option<&Commit> {
        self.commits.get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.commits.contains_key(hash)
    }

    /// All commits newer than `since`, newest first. Ties are broken by
    /// hash so the order is deterministic across runs.
    pub fn commits_since(&self, since: DateTime<Utc>) -> Vec<&Commit> {
        let mut commits: Vec<&Commit> = self
            .commits
            .values()
            .filter(|c| c.timestamp >= since)
            .collect();
        commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.hash.cmp(&b.hash)));
        commits
    }

    /// All commits, newest first.
    pub fn all_commits(&self) -> Vec<&Commit> {
        self.commits_since(DateTime::<Utc>::MIN_UTC)
    }

    /// Walk first-parent ancestry starting at (and including) `from`.
    ///
    /// The walk stops at the first commit missing from the snapshot. A
    /// visited set guards against malformed history.
    pub fn first_parent_chain(&self, from: &str) -> Vec<&Commit> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(from.to_string());
        while let Some(hash) = cursor {
            if !seen.insert(hash.clone()) {
                break;
            }
            match self.commits.get(&hash) {
                Some(commit) => {
                    cursor = commit.first_parent().map(str::to_string);
                    chain.push(commit);
                }
                None => break,
            }
        }
        chain
    }

    /// All ancestors of `from`, including `from`, across all parents.
    fn ancestors(&self, from: &str) -> HashSet<&str> {
        let mut out: HashSet<&str> = HashSet::new();
        let mut stack = vec![from];
        while let Some(hash) = stack.pop() {
            let Some(commit) = self.commits.get(hash) else {
                continue;
            };
            if !out.insert(commit.hash.as_str()) {
                continue;
            }
            stack.extend(commit.parents.iter().map(String::as_str));
        }
        out
    }

    /// `git rev-list start..end`: ancestors of `end` that are not ancestors
    /// of `start`, newest first. Exclusive of `start`, inclusive of `end`.
    pub fn rev_list(&self, start: &str, end: &str) -> Result<Vec<String>, RepoError> {
        for hash in [start, end] {
            if !self.contains(hash) {
                return Err(RepoError::UnknownCommit {
                    repo: self.repo.clone(),
                    hash: hash.to_string(),
                });
            }
        }
        let excluded = self.ancestors(start);
        let mut commits: Vec<&Commit> = self
            .ancestors(end)
            .into_iter()
            .filter(|hash| !excluded.contains(hash))
            .map(|hash| &self.commits[hash])
            .collect();
        commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.hash.cmp(&b.hash)));
        Ok(commits.into_iter().map(|c| c.hash.clone()).collect())
    }
}

/// The set of watched repositories.
#[derive(Debug, Clone, Default)]
pub struct RepoMap {
    repos: HashMap<String, RepoGraph>,
}

impl RepoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, graph: RepoGraph) {
        self.repos.insert(graph.repo().to_string(), graph);
    }

    pub fn get(&self, repo: &str) -> Option<&RepoGraph> {
        self.repos.get(repo)
    }

    pub fn get_mut(&mut self, repo: &str) -> Option<&mut RepoGraph> {
        self.repos.get_mut(repo)
    }

    pub fn repos(&self) -> impl Iterator<Item = &RepoGraph> {
        self.repos.values()
    }

    /// Repository names in deterministic order.
    pub fn repo_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repos.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a commit hash to the repo graph holding it.
    pub fn resolve(&self, repo: &str, hash: &str) -> bool {
        self.repos.get(repo).is_some_and(|g| g.contains(hash))
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use chrono::TimeZone;

    /// Build a linear chain `c0 <- c1 <- ... <- c{n-1}`, one commit per
    /// minute starting at the Unix epoch plus one hour.
    pub fn linear_graph(repo: &str, hashes: &[&str]) -> RepoGraph {
        let mut graph = RepoGraph::new(repo);
        for (i, hash) in hashes.iter().enumerate() {
            let parents = if i == 0 {
                vec![]
            } else {
                vec![hashes[i - 1].to_string()]
            };
            graph.insert(Commit {
                hash: hash.to_string(),
                parents,
                author: "author@example.com".into(),
                subject: format!("commit {hash}"),
                timestamp: Utc.timestamp_opt(3600 + 60 * i as i64, 0).unwrap(),
            });
        }
        graph
    }
}
