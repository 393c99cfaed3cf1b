//! Prometheus metrics for the scheduling engine, registered on the default
//! global registry so an embedding process can scrape them.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    pub static ref TICK_COUNT: Counter = register_counter!(
        "foreman_tick_count",
        "the number of scheduling ticks run"
    )
    .unwrap();

    pub static ref TICK_DURATION_MILLIS: Histogram = register_histogram!(
        "foreman_tick_duration_millis",
        "the duration of one scheduling tick",
        prometheus::exponential_buckets(1.0, 4.0, 10).unwrap()
    )
    .unwrap();

    pub static ref CANDIDATE_COUNT: Histogram = register_histogram!(
        "foreman_candidate_count",
        "candidates enumerated per tick",
        prometheus::exponential_buckets(1.0, 4.0, 10).unwrap()
    )
    .unwrap();

    pub static ref DISPATCH_COUNT: Counter = register_counter!(
        "foreman_dispatch_count",
        "the number of tasks dispatched to the executor"
    )
    .unwrap();

    pub static ref CFG_CACHE_LOOKUP_COUNT: CounterVec = register_counter_vec!(
        "foreman_cfg_cache_lookup_count",
        "task-config cache lookups, by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref DISPATCH_FAILURE_COUNT: CounterVec = register_counter_vec!(
        "foreman_dispatch_failure_count",
        "dispatches that failed, by cause",
        &["cause"]
    )
    .unwrap();

    pub static ref COMPLETION_COUNT: CounterVec = register_counter_vec!(
        "foreman_completion_count",
        "completion events applied, by resulting status",
        &["status"]
    )
    .unwrap();
}
