//! # Foreman skip rules
//!
//! A small replicated database of predicates that mask out
//! `(task spec, commit)` pairs before the scheduler scores them. Rules are
//! persisted in a shared document store; every scheduler process keeps a
//! compiled local view that is replaced atomically on each change-stream
//! update, so a tick always sees either the whole old rule set or the
//! whole new one.

mod redis_store;
mod rules;
mod store;
mod view;

pub use redis_store::RedisRuleStore;
pub use rules::{commit_range, validate_rule, SkipRule};
pub use store::{InMemoryRuleStore, SkipRuleError, SkipRuleStore};
pub use view::SkipRules;
