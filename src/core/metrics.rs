// src/core/metrics.rs

//! Defines and registers Prometheus metrics for subsystem monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Gauges updated by the metrics aggregator ---
    /// The hit ratio across all caches over the process lifetime.
    pub static ref GLOBAL_HIT_RATIO: Gauge =
        register_gauge!("stratacache_global_hit_ratio", "Hit ratio across all caches.").unwrap();
    /// The mean read latency across all caches, in milliseconds.
    pub static ref AVG_READ_LATENCY_MS: Gauge =
        register_gauge!("stratacache_avg_read_latency_ms", "Mean read latency across all caches in milliseconds.").unwrap();
    /// Read operations per second observed over the last aggregation interval.
    pub static ref READS_PER_SECOND: Gauge =
        register_gauge!("stratacache_reads_per_second", "Read operations per second over the last aggregation interval.").unwrap();
    /// The composite health score, between 0 and 100.
    pub static ref HEALTH_SCORE: Gauge =
        register_gauge!("stratacache_health_score", "Composite cache health score (0-100).").unwrap();
    /// Resident memory of the process in megabytes.
    pub static ref PROCESS_MEMORY_MB: Gauge =
        register_gauge!("stratacache_process_memory_mb", "Resident memory of the process in megabytes.").unwrap();

    // --- Counters updated on the hot paths ---
    /// Cache hits, labeled by cache name and tier.
    pub static ref CACHE_HITS_TOTAL: CounterVec =
        register_counter_vec!("stratacache_hits_total", "Total cache hits, labeled by cache and tier.", &["cache", "tier"]).unwrap();
    /// Cache misses, labeled by cache name.
    pub static ref CACHE_MISSES_TOTAL: CounterVec =
        register_counter_vec!("stratacache_misses_total", "Total cache misses, labeled by cache.", &["cache"]).unwrap();
    /// Entries evicted from local tiers due to capacity limits.
    pub static ref EVICTIONS_TOTAL: Counter =
        register_counter!("stratacache_evictions_total", "Total entries evicted from local tiers.").unwrap();
    /// Entries removed by the TTL sweeper.
    pub static ref SWEPT_KEYS_TOTAL: Counter =
        register_counter!("stratacache_swept_keys_total", "Total expired entries removed by the sweeper.").unwrap();
    /// Invalidation events processed, labeled by event type.
    pub static ref INVALIDATIONS_TOTAL: CounterVec =
        register_counter_vec!("stratacache_invalidations_total", "Total invalidation events processed, labeled by type.", &["type"]).unwrap();
    /// Events dropped because the invalidation channel was full.
    pub static ref EVENTS_DROPPED_TOTAL: Counter =
        register_counter!("stratacache_events_dropped_total", "Total events dropped due to a full invalidation channel.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
