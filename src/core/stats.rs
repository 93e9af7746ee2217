// src/core/stats.rs

//! Per-cache counters and the snapshots handed to the metrics aggregator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Holds all counters for a single cache. Counters are monotonically
/// non-decreasing and updated with relaxed atomics on the hot paths.
#[derive(Debug, Default)]
pub struct CacheStats {
    reads: AtomicU64,
    writes: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the latency of one read operation.
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn total_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Produces a point-in-time copy of all counters with derived ratios.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let reads = self.reads.load(Ordering::Relaxed);
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let micros = self.latency_micros.load(Ordering::Relaxed);
        let hits = l1_hits + l2_hits;
        CacheStatsSnapshot {
            reads,
            writes: self.writes.load(Ordering::Relaxed),
            l1_hits,
            l2_hits,
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_ratio: if reads > 0 {
                hits as f64 / reads as f64
            } else {
                0.0
            },
            avg_latency_ms: if samples > 0 {
                micros as f64 / samples as f64 / 1_000.0
            } else {
                0.0
            },
        }
    }
}

/// A point-in-time view of one cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    pub avg_latency_ms: f64,
}

impl CacheStatsSnapshot {
    pub fn hits(&self) -> u64 {
        self.l1_hits + self.l2_hits
    }

    pub fn error_rate(&self) -> f64 {
        if self.reads + self.writes > 0 {
            self.errors as f64 / (self.reads + self.writes) as f64
        } else {
            0.0
        }
    }
}
