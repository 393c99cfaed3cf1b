use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::graph::{Commit, RepoMap};

/// The sliding view of recent commits for which hot state is retained.
///
/// A repo's window starts at `now - duration`, extended backwards when
/// necessary so that at least `min_commits` of the repo's most recent
/// commits stay inside even during quiet periods.
#[derive(Debug, Clone)]
pub struct Window {
    duration: Duration,
    min_commits: usize,
    starts: HashMap<String, DateTime<Utc>>,
}

impl Window {
    /// Compute the window over the current repo snapshots.
    pub fn compute(duration: Duration, min_commits: usize, repos: &RepoMap, now: DateTime<Utc>) -> Self {
        let threshold = now - duration;
        let mut starts = HashMap::new();
        for graph in repos.repos() {
            let commits = graph.all_commits();
            let mut start = threshold;
            // Extend back to the min_commits-th most recent commit.
            if min_commits > 0 {
                if let Some(commit) = commits.get(min_commits - 1).or_else(|| commits.last()) {
                    start = start.min(commit.timestamp);
                }
            }
            starts.insert(graph.repo().to_string(), start);
        }
        Self {
            duration,
            min_commits,
            starts,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn min_commits(&self) -> usize {
        self.min_commits
    }

    /// Start of the window for `repo`; unknown repos have no window.
    pub fn start(&self, repo: &str) -> Option<DateTime<Utc>> {
        self.starts.get(repo).copied()
    }

    /// The earliest start across all repos; used when rebuilding caches
    /// from the durable store.
    pub fn earliest_start(&self) -> Option<DateTime<Utc>> {
        self.starts.values().min().copied()
    }

    /// Whether a timestamp in `repo` falls inside the window.
    pub fn test_time(&self, repo: &str, ts: DateTime<Utc>) -> bool {
        self.start(repo).is_some_and(|start| ts >= start)
    }

    /// Whether a commit falls inside the window.
    pub fn test_commit(&self, repo: &str, commit: &Commit) -> bool {
        self.test_time(repo, commit.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::linear_graph;
    use chrono::TimeZone;

    fn map(hashes: &[&str]) -> RepoMap {
        let mut map = RepoMap::new();
        map.insert(linear_graph("repo", hashes));
        map
    }

    #[test]
    fn window_is_time_bounded() {
        // Commits at t = 3600, 3660, 3720, 3780.
        let repos = map(&["a", "b", "c", "d"]);
        let now = Utc.timestamp_opt(3800, 0).unwrap();
        let window = Window::compute(Duration::seconds(100), 1, &repos, now);
        let graph = repos.get("repo").unwrap();
        assert!(window.test_commit("repo", graph.get("d").unwrap()));
        assert!(window.test_commit("repo", graph.get("c").unwrap()));
        assert!(!window.test_commit("repo", graph.get("b").unwrap()));
        assert!(!window.test_commit("repo", graph.get("a").unwrap()));
    }

    #[test]
    fn floor_keeps_most_recent_commits_in_quiet_repos() {
        let repos = map(&["a", "b", "c", "d"]);
        // "now" is far past every commit; a pure time window would be empty.
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let window = Window::compute(Duration::seconds(100), 3, &repos, now);
        let graph = repos.get("repo").unwrap();
        assert!(window.test_commit("repo", graph.get("d").unwrap()));
        assert!(window.test_commit("repo", graph.get("c").unwrap()));
        assert!(window.test_commit("repo", graph.get("b").unwrap()));
        assert!(!window.test_commit("repo", graph.get("a").unwrap()));
    }

    #[test]
    fn floor_larger_than_history_keeps_everything() {
        let repos = map(&["a", "b"]);
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let window = Window::compute(Duration::seconds(1), 10, &repos, now);
        let graph = repos.get("repo").unwrap();
        assert!(window.test_commit("repo", graph.get("a").unwrap()));
        assert!(window.test_commit("repo", graph.get("b").unwrap()));
    }

    #[test]
    fn unknown_repo_is_outside_the_window() {
        let repos = map(&["a"]);
        let window = Window::compute(Duration::hours(1), 1, &repos, Utc::now());
        assert!(!window.test_time("other", Utc::now()));
        assert!(window.earliest_start().is_some());
    }
}
