use std::collections::HashSet;

use foreman_repograph::RepoMap;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use crate::store::SkipRuleError;

/// Longest allowed rule name.
pub const MAX_NAME_CHARS: usize = 50;

/// A predicate excluding `(task spec, commit)` pairs from scheduling.
///
/// A rule matches a pair iff the spec name matches any of
/// `task_spec_patterns` (empty list matches every spec) and the commit is
/// in `commits` (empty list matches every commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkipRule {
    pub name: String,
    pub added_by: String,
    pub description: String,
    pub task_spec_patterns: Vec<String>,
    pub commits: Vec<String>,
}

impl Default for SkipRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            added_by: String::new(),
            description: String::new(),
            task_spec_patterns: Vec::new(),
            commits: Vec::new(),
        }
    }
}

/// Validate a rule before it is persisted.
///
/// `repos` is consulted to ensure every listed commit actually resolves;
/// uniqueness of the name is the store's job.
pub fn validate_rule(rule: &SkipRule, repos: &RepoMap) -> Result<(), SkipRuleError> {
    let name_chars = rule.name.chars().count();
    if name_chars == 0 || name_chars > MAX_NAME_CHARS {
        return Err(SkipRuleError::Validation(format!(
            "rule name must be 1-{MAX_NAME_CHARS} characters, got {name_chars}"
        )));
    }
    if rule.added_by.is_empty() {
        return Err(SkipRuleError::Validation(format!(
            "rule {:?} has no addedBy",
            rule.name
        )));
    }
    if rule.task_spec_patterns.is_empty() && rule.commits.is_empty() {
        return Err(SkipRuleError::Validation(format!(
            "rule {:?} matches nothing: needs taskSpecPatterns or commits",
            rule.name
        )));
    }
    for pattern in &rule.task_spec_patterns {
        Regex::new(pattern).map_err(|e| {
            SkipRuleError::Validation(format!("rule {:?} pattern {pattern:?}: {e}", rule.name))
        })?;
    }
    for commit in &rule.commits {
        let resolves = repos.repos().any(|g| g.contains(commit));
        if !resolves {
            return Err(SkipRuleError::Validation(format!(
                "rule {:?} commit {commit:?} does not resolve in any watched repo",
                rule.name
            )));
        }
    }
    Ok(())
}

/// Render a commit range into an explicit commit list for a rule.
///
/// The underlying rev-list is exclusive of `start` and inclusive of `end`;
/// the rule convention is the opposite, so the list is shifted by dropping
/// its first element and appending `start`.
pub fn commit_range(
    repos: &RepoMap,
    repo: &str,
    start: &str,
    end: &str,
) -> Result<Vec<String>, SkipRuleError> {
    let graph = repos
        .get(repo)
        .ok_or_else(|| SkipRuleError::Validation(format!("unknown repo {repo:?}")))?;
    for hash in [start, end] {
        if !graph.contains(hash) {
            return Err(SkipRuleError::Validation(format!(
                "commit {hash:?} is not in {repo:?}"
            )));
        }
    }
    let mut commits = graph
        .rev_list(start, end)
        .map_err(|e| SkipRuleError::Validation(e.to_string()))?;
    if commits.is_empty() {
        return Err(SkipRuleError::Validation(format!(
            "commit range {start}..{end} is empty"
        )));
    }
    commits.remove(0);
    commits.push(start.to_string());

    if !commits.iter().any(|c| c == start) || commits.iter().any(|c| c == end) {
        return Err(SkipRuleError::Validation(format!(
            "commit range {start}..{end} did not shift cleanly"
        )));
    }
    Ok(commits)
}

/// A rule with its patterns compiled into one [`RegexSet`], ready for
/// matching.
#[derive(Debug)]
pub(crate) struct CompiledRule {
    pub name: String,
    patterns: RegexSet,
    commits: HashSet<String>,
}

impl CompiledRule {
    /// Compile a persisted rule. Patterns that fail to compile make the
    /// whole rule unusable; the store validated them at creation, so this
    /// only happens when the store contents are corrupt.
    pub fn compile(rule: &SkipRule) -> Result<Self, SkipRuleError> {
        let patterns = RegexSet::new(&rule.task_spec_patterns).map_err(|e| {
            SkipRuleError::Validation(format!(
                "rule {:?} patterns do not compile: {e}",
                rule.name
            ))
        })?;
        Ok(Self {
            name: rule.name.clone(),
            patterns,
            commits: rule.commits.iter().cloned().collect(),
        })
    }

    pub fn matches(&self, task_spec: &str, commit: &str) -> bool {
        // An empty pattern set matches every spec; an empty commit list
        // matches every commit.
        let spec_ok = self.patterns.is_empty() || self.patterns.is_match(task_spec);
        let commit_ok = self.commits.is_empty() || self.commits.contains(commit);
        spec_ok && commit_ok
    }
}
