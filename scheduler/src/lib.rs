//! # Foreman scheduling engine
//!
//! The tick pipeline that turns repository state into dispatched tasks:
//!
//! 1. enumerate candidate `(RepoState, task spec)` pairs over the commit
//!    window, newest first, masking out skip-rule matches, duplicates,
//!    unsatisfiable dimensions and exhausted retries;
//! 2. score each candidate with the blameless-regression heuristic
//!    (`priority * stoleness * forced boost`);
//! 3. match candidates to idle machines greedily in descending score
//!    order;
//! 4. dispatch: reserve the machine, write a pending task record, trigger
//!    the executor, record the handle.
//!
//! Ticks never overlap; per-candidate failures are logged and skipped so a
//! single bad candidate cannot starve the rest of the pipeline. Completion
//! events arrive on a separate ingress path and are applied through the
//! task store's CAS discipline, with a periodic reconciliation sweep as a
//! safety net for lost notifications.

mod busy;
mod candidate;
mod engine;
mod ingress;
mod matcher;
pub mod metrics;
mod scoring;

pub use busy::BusyMachines;
pub use candidate::Candidate;
pub use engine::{Scheduler, SchedulerConfig, TickSummary};
pub use ingress::{completion_ingress, reconcile_loop};
