use foreman_repograph::{RepoGraph, Window};
use foreman_taskdb::TaskCache;

/// Score boost applied when a forced job names the candidate's spec.
const FORCED_BOOST: f64 = 0.5;

/// Compute the blame list for a run of `name` at `revision`: the
/// first-parent chain starting at the candidate's commit, stopping at the
/// first commit already covered by a successful run of the same spec, or
/// at the window tail.
///
/// Newest first; the candidate's own commit is always included.
pub async fn blame_list(
    graph: &RepoGraph,
    window: &Window,
    tasks: &TaskCache,
    revision: &str,
    name: &str,
) -> Vec<String> {
    let mut blame = Vec::new();
    for commit in graph.first_parent_chain(revision) {
        let own = commit.hash == revision;
        if !own {
            if !window.test_commit(graph.repo(), commit) {
                break;
            }
            if tasks
                .has_success_covering(graph.repo(), &commit.hash, name)
                .await
            {
                break;
            }
        }
        blame.push(commit.hash.clone());
    }
    blame
}

/// The blameless-regression score: a candidate bisecting a larger gap of
/// unvetted commits is worth more, and explicitly requested work gets a
/// boost.
pub fn score(priority: f64, blame_len: usize, forced: bool) -> f64 {
    priority * blame_len as f64 * (1.0 + if forced { FORCED_BOOST } else { 0.0 })
}
