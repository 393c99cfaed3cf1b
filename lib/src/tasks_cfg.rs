//! The declarative task graph read from `infra/bots/tasks.json` in each
//! repository revision.
//!
//! The file shape follows the convention:
//!
//! ```json
//! {
//!   "casSpecs": { "<name>": { "root": "...", "paths": ["..."] } },
//!   "tasks":    { "<name>": { "dimensions": ["os:Linux"], ... } },
//!   "jobs":     { "<name>": { "priority": 0.8, "tasks": ["..."] } }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Description of an isolated input tree, addressed by content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CasSpec {
    pub root: String,
    pub paths: Vec<String>,
    pub excludes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A CIPD package to install on the machine before the command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CipdPackage {
    pub name: String,
    pub path: String,
    pub version: String,
}

/// Declarative description of one executable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSpec {
    /// Names of other task specs whose successful results this spec
    /// consumes as inputs.
    pub dependencies: Vec<String>,
    /// `"key:value"` constraints the machine must satisfy.
    pub dimensions: Vec<String>,
    pub cas_spec: String,
    pub cipd_packages: Vec<CipdPackage>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub execution_timeout_ns: u64,
    pub io_timeout_ns: u64,
    pub expiration_ns: u64,
    /// Scheduling priority in (0, 1].
    pub priority: f64,
    pub idempotent: bool,
    pub outputs: Vec<String>,
    pub service_account: String,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            dependencies: Vec::new(),
            dimensions: Vec::new(),
            cas_spec: String::new(),
            cipd_packages: Vec::new(),
            command: Vec::new(),
            env: BTreeMap::new(),
            env_prefixes: BTreeMap::new(),
            execution_timeout_ns: 0,
            io_timeout_ns: 0,
            expiration_ns: 0,
            priority: 0.5,
            idempotent: false,
            outputs: Vec::new(),
            service_account: String::new(),
        }
    }
}

/// A named, user-visible target composed of one or more task specs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSpec {
    pub priority: f64,
    pub tasks: Vec<String>,
}

/// The complete task configuration of a single RepoState.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TasksCfg {
    pub cas_specs: BTreeMap<String, CasSpec>,
    pub tasks: BTreeMap<String, TaskSpec>,
    pub jobs: BTreeMap<String, JobSpec>,
}

impl TasksCfg {
    /// Parse a tasks file and validate the graph it describes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let cfg: TasksCfg =
            serde_json::from_slice(bytes).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check internal consistency: every referenced name resolves, every
    /// priority is in range, and the dependency graph has no cycles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, job) in &self.jobs {
            if job.tasks.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "job {name:?} names no tasks"
                )));
            }
            for task in &job.tasks {
                if !self.tasks.contains_key(task) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "job {name:?} references unknown task {task:?}"
                    )));
                }
            }
        }
        for (name, spec) in &self.tasks {
            if !(spec.priority > 0.0 && spec.priority <= 1.0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "task {name:?} priority {} is outside (0, 1]",
                    spec.priority
                )));
            }
            for dep in &spec.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task {name:?} depends on unknown task {dep:?}"
                    )));
                }
            }
            if !spec.cas_spec.is_empty() && !self.cas_specs.contains_key(&spec.cas_spec) {
                return Err(ConfigError::InvalidConfig(format!(
                    "task {name:?} references unknown casSpec {:?}",
                    spec.cas_spec
                )));
            }
        }
        self.check_cycles()?;
        Ok(())
    }

    fn check_cycles(&self) -> Result<(), ConfigError> {
        // Iterative DFS; `visiting` holds the names on the current path.
        let mut done: HashSet<&str> = HashSet::new();
        for start in self.tasks.keys() {
            if done.contains(start.as_str()) {
                continue;
            }
            let mut visiting: HashSet<&str> = HashSet::new();
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            visiting.insert(start.as_str());
            while let Some((name, next_dep)) = stack.pop() {
                let deps = &self.tasks[name].dependencies;
                if next_dep < deps.len() {
                    stack.push((name, next_dep + 1));
                    let dep = deps[next_dep].as_str();
                    if visiting.contains(dep) {
                        return Err(ConfigError::InvalidConfig(format!(
                            "dependency cycle involving task {dep:?}"
                        )));
                    }
                    if !done.contains(dep) {
                        visiting.insert(dep);
                        stack.push((dep, 0));
                    }
                } else {
                    visiting.remove(name);
                    done.insert(name);
                }
            }
        }
        Ok(())
    }
}
