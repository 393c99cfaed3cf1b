use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use foreman_lib::{RepoState, TaskSpec};

/// A schedulable `(RepoState, task spec)` pair, scored and ready for
/// machine matching.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub repo_state: RepoState,
    /// Task spec name.
    pub name: String,
    pub spec: TaskSpec,
    /// Blame list: contiguous first-parent commits this attempt would
    /// speak for, newest first, starting at the RepoState's revision.
    pub blame: Vec<String>,
    pub score: f64,
    /// An unfinished forced job names this spec at this RepoState.
    pub forced: bool,
    /// 0-based attempt counter (prior attempts at this pair).
    pub attempt: u32,
    /// IDs of the dependency tasks whose outputs this candidate consumes.
    pub parent_task_ids: Vec<String>,
    /// Every dependency already has a terminal successful task. Candidates
    /// emitted on the strength of same-tick dependency candidates carry
    /// `false` and are not dispatched this tick.
    pub deps_satisfied: bool,
    /// Timestamp of the RepoState's commit; drives the age tie-break.
    pub commit_ts: DateTime<Utc>,
    /// CAS digest of the input tree, resolved from the config's casSpecs.
    pub cas_input: String,
}

impl Candidate {
    /// Dispatch order: higher score first; ties broken by higher priority,
    /// longer blame list, older commit, then spec name. Total and
    /// deterministic.
    pub fn dispatch_order(a: &Candidate, b: &Candidate) -> Ordering {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.spec
                    .priority
                    .partial_cmp(&a.spec.priority)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.blame.len().cmp(&a.blame.len()))
            .then_with(|| a.commit_ts.cmp(&b.commit_ts))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.repo_state.cmp(&b.repo_state))
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {} (score {:.3}, blame {})",
            self.name,
            self.repo_state,
            self.score,
            self.blame.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, score: f64, blame: usize, ts_secs: i64) -> Candidate {
        Candidate {
            repo_state: RepoState::new("repo", name),
            name: name.to_string(),
            spec: TaskSpec::default(),
            blame: (0..blame).map(|i| format!("c{i}")).collect(),
            score,
            forced: false,
            attempt: 0,
            parent_task_ids: vec![],
            deps_satisfied: true,
            commit_ts: chrono::TimeZone::timestamp_opt(&Utc, ts_secs, 0).unwrap(),
            cas_input: String::new(),
        }
    }

    #[test]
    fn higher_score_dispatches_first() {
        let mut list = vec![candidate("low", 1.0, 1, 0), candidate("high", 2.0, 1, 0)];
        list.sort_by(Candidate::dispatch_order);
        assert_eq!(list[0].name, "high");
    }

    #[test]
    fn ties_break_on_blame_then_age_then_name() {
        let mut list = vec![
            candidate("b", 1.0, 1, 100),
            candidate("a", 1.0, 1, 100),
            candidate("older", 1.0, 1, 50),
            candidate("longer-blame", 1.0, 3, 100),
        ];
        list.sort_by(Candidate::dispatch_order);
        assert_eq!(list[0].name, "longer-blame");
        assert_eq!(list[1].name, "older");
        assert_eq!(list[2].name, "a");
        assert_eq!(list[3].name, "b");
    }
}
