// src/core/tasks/aggregator.rs

//! Pulls per-cache snapshots on a fixed cadence and composes the global
//! view: hit ratio, latency, throughput, rolling history, insights,
//! bottlenecks, load prediction, and the composite health score.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{AlertsConfig, MetricsConfig};
use crate::core::invalidation::InvalidationManager;
use crate::core::metrics;
use crate::core::query::QueryResultCache;
use crate::core::stats::CacheStats;
use crate::core::tier1::LocalTier;
use crate::core::tier2::Tier2Store;

/// Bound on the rolling snapshot history (24 h at one per minute).
const SNAPSHOT_RING_MAX: usize = 1440;
/// Evictions per window above this raise an insight.
const EVICTION_ALERT_THRESHOLD: u64 = 1_000;
/// RBAC hit ratio below this raises an insight.
const RBAC_MIN_HIT_RATIO: f64 = 0.90;
/// T2 round-trip above this flags a network bottleneck.
const NETWORK_BOTTLENECK_LATENCY: Duration = Duration::from_millis(20);
/// Global hit ratio below this flags a strategy bottleneck.
const STRATEGY_BOTTLENECK_RATIO: f64 = 0.85;
/// Number of trailing snapshots used for load prediction.
const PREDICTION_WINDOW: usize = 10;
/// How often old snapshots are swept out of the ring.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One sample of the global cache state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global_hit_ratio: f64,
    pub avg_latency_ms: f64,
    pub rps: f64,
    pub error_rate: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    fn health_penalty(self) -> f64 {
        match self {
            Severity::Medium => 5.0,
            Severity::High => 10.0,
            Severity::Critical => 20.0,
        }
    }
}

/// A human-readable warning derived from the current window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckKind {
    Network,
    Strategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub detail: String,
}

/// Projected request rates from the trailing RPS window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadPrediction {
    pub next_hour_rps: f64,
    pub next_day_rps: f64,
    pub confidence: f64,
}

/// The full derived analysis for one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub insights: Vec<Insight>,
    pub hot_spots: Vec<(String, u64)>,
    pub bottlenecks: Vec<Bottleneck>,
    pub prediction: LoadPrediction,
    pub health_score: f64,
}

/// Collects, aggregates, and analyzes cache metrics.
pub struct MetricsAggregator {
    config: MetricsConfig,
    alerts: AlertsConfig,
    session_stats: Arc<CacheStats>,
    rbac_stats: Arc<CacheStats>,
    query_stats: Arc<CacheStats>,
    tiers: Vec<Arc<dyn LocalTier>>,
    queries: Arc<QueryResultCache>,
    invalidation: Arc<InvalidationManager>,
    t2: Arc<dyn Tier2Store>,
    ring: Mutex<VecDeque<MetricsSnapshot>>,
    latest_report: Mutex<Option<AnalysisReport>>,
    last_reads: AtomicU64,
    last_evictions: AtomicU64,
    last_invalidation_failures: AtomicU64,
    system: Mutex<System>,
}

impl MetricsAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MetricsConfig,
        alerts: AlertsConfig,
        session_stats: Arc<CacheStats>,
        rbac_stats: Arc<CacheStats>,
        query_stats: Arc<CacheStats>,
        tiers: Vec<Arc<dyn LocalTier>>,
        queries: Arc<QueryResultCache>,
        invalidation: Arc<InvalidationManager>,
        t2: Arc<dyn Tier2Store>,
    ) -> Self {
        Self {
            config,
            alerts,
            session_stats,
            rbac_stats,
            query_stats,
            tiers,
            queries,
            invalidation,
            t2,
            ring: Mutex::new(VecDeque::with_capacity(SNAPSHOT_RING_MAX)),
            latest_report: Mutex::new(None),
            last_reads: AtomicU64::new(0),
            last_evictions: AtomicU64::new(0),
            last_invalidation_failures: AtomicU64::new(0),
            system: Mutex::new(System::new()),
        }
    }

    /// Runs the aggregation loop, with a daily retention sweep folded in.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval = ?self.config.interval, "metrics aggregator started");
        let mut collect_interval = tokio::time::interval(self.config.interval);
        let mut retention_interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = collect_interval.tick() => {
                    self.collect_cycle().await;
                }
                _ = retention_interval.tick() => {
                    self.retention_sweep();
                }
                _ = shutdown_rx.recv() => {
                    // Flush one final snapshot so the ring reflects shutdown state.
                    self.collect_cycle().await;
                    info!("metrics aggregator shutting down");
                    return;
                }
            }
        }
    }

    /// One collection pass: compose the snapshot, update the ring and the
    /// exported gauges, and derive the analysis report.
    pub async fn collect_cycle(&self) -> MetricsSnapshot {
        let session = self.session_stats.snapshot();
        let rbac = self.rbac_stats.snapshot();
        let query = self.query_stats.snapshot();

        let reads = session.reads + rbac.reads + query.reads;
        let hits = session.hits() + rbac.hits() + query.hits();
        let hit_ratio = if reads > 0 {
            hits as f64 / reads as f64
        } else {
            0.0
        };
        let avg_latency_ms =
            (session.avg_latency_ms + rbac.avg_latency_ms + query.avg_latency_ms) / 3.0;

        let prev_reads = self.last_reads.swap(reads, Ordering::Relaxed);
        let rps = reads.saturating_sub(prev_reads) as f64 / self.config.interval.as_secs_f64();

        let writes = session.writes + rbac.writes + query.writes;
        let errors = session.errors + rbac.errors + query.errors;
        let error_rate = if reads + writes > 0 {
            errors as f64 / (reads + writes) as f64
        } else {
            0.0
        };

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            global_hit_ratio: hit_ratio,
            avg_latency_ms,
            rps,
            error_rate,
            memory_mb: self.process_memory_mb(),
        };

        {
            let mut ring = self.ring.lock();
            ring.push_back(snapshot.clone());
            while ring.len() > SNAPSHOT_RING_MAX {
                ring.pop_front();
            }
        }

        metrics::GLOBAL_HIT_RATIO.set(hit_ratio);
        metrics::AVG_READ_LATENCY_MS.set(avg_latency_ms);
        metrics::READS_PER_SECOND.set(rps);
        metrics::PROCESS_MEMORY_MB.set(snapshot.memory_mb);

        let report = self.analyze(&snapshot, reads, &rbac).await;
        metrics::HEALTH_SCORE.set(report.health_score);
        for insight in &report.insights {
            warn!(severity = ?insight.severity, "{}", insight.message);
        }
        *self.latest_report.lock() = Some(report);

        debug!(
            hit_ratio,
            avg_latency_ms, rps, "metrics collection cycle complete"
        );
        snapshot
    }

    /// Derives insights, bottlenecks, prediction, and the health score.
    async fn analyze(
        &self,
        snapshot: &MetricsSnapshot,
        total_reads: u64,
        rbac: &crate::core::stats::CacheStatsSnapshot,
    ) -> AnalysisReport {
        let mut insights = Vec::new();

        if total_reads > 0 {
            if snapshot.global_hit_ratio < self.alerts.min_hit_ratio {
                insights.push(Insight {
                    severity: Severity::High,
                    message: format!(
                        "global hit ratio {:.2} below target {:.2}",
                        snapshot.global_hit_ratio, self.alerts.min_hit_ratio
                    ),
                });
            }
            if rbac.reads > 0 && rbac.hit_ratio < RBAC_MIN_HIT_RATIO {
                insights.push(Insight {
                    severity: Severity::Medium,
                    message: format!(
                        "rbac hit ratio {:.2} below target {RBAC_MIN_HIT_RATIO:.2}",
                        rbac.hit_ratio
                    ),
                });
            }
        }
        if snapshot.avg_latency_ms > self.alerts.max_latency_ms {
            insights.push(Insight {
                severity: Severity::High,
                message: format!(
                    "average latency {:.1} ms above target {:.1} ms",
                    snapshot.avg_latency_ms, self.alerts.max_latency_ms
                ),
            });
        }
        let evictions: u64 = self.tiers.iter().map(|t| t.eviction_count()).sum();
        let eviction_delta = evictions.saturating_sub(self.last_evictions.swap(evictions, Ordering::Relaxed));
        if eviction_delta > EVICTION_ALERT_THRESHOLD {
            insights.push(Insight {
                severity: Severity::Medium,
                message: format!("{eviction_delta} evictions in the last window"),
            });
        }
        let invalidation = self.invalidation.snapshot();
        let failure_delta = invalidation
            .failed
            .saturating_sub(self.last_invalidation_failures.swap(invalidation.failed, Ordering::Relaxed));
        if failure_delta > 0 {
            insights.push(Insight {
                severity: Severity::Medium,
                message: format!("{failure_delta} invalidation events completed with failures"),
            });
        }
        if snapshot.error_rate > self.alerts.max_error_rate {
            insights.push(Insight {
                severity: Severity::Critical,
                message: format!(
                    "error rate {:.3} above target {:.3}",
                    snapshot.error_rate, self.alerts.max_error_rate
                ),
            });
        }

        let mut bottlenecks = Vec::new();
        let ping_started = Instant::now();
        match self.t2.ping().await {
            Ok(_) => {
                let rtt = ping_started.elapsed();
                if rtt > NETWORK_BOTTLENECK_LATENCY {
                    bottlenecks.push(Bottleneck {
                        kind: BottleneckKind::Network,
                        detail: format!("tier-2 round-trip is {} ms", rtt.as_millis()),
                    });
                }
            }
            Err(e) => bottlenecks.push(Bottleneck {
                kind: BottleneckKind::Network,
                detail: format!("tier-2 ping failed: {e}"),
            }),
        }
        if total_reads > 0 && snapshot.global_hit_ratio < STRATEGY_BOTTLENECK_RATIO {
            bottlenecks.push(Bottleneck {
                kind: BottleneckKind::Strategy,
                detail: format!(
                    "hit ratio {:.2} suggests TTLs or capacities need tuning",
                    snapshot.global_hit_ratio
                ),
            });
        }

        let prediction = self.predict_load(snapshot.rps);
        let health_score = compute_health_score(snapshot, total_reads, &insights);

        AnalysisReport {
            insights,
            hot_spots: self.queries.top_queries(5),
            bottlenecks,
            prediction,
            health_score,
        }
    }

    /// Projects near-term load from the trailing RPS window.
    fn predict_load(&self, current_rps: f64) -> LoadPrediction {
        let ring = self.ring.lock();
        let samples: Vec<f64> = ring
            .iter()
            .rev()
            .take(PREDICTION_WINDOW)
            .map(|s| s.rps)
            .collect();
        let mean = if samples.is_empty() {
            current_rps
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };
        LoadPrediction {
            next_hour_rps: mean * 1.1,
            next_day_rps: mean * 1.5,
            confidence: if samples.len() >= PREDICTION_WINDOW {
                0.7
            } else {
                0.5
            },
        }
    }

    /// Drops snapshots older than the configured retention.
    fn retention_sweep(&self) {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        let mut ring = self.ring.lock();
        let before = ring.len();
        ring.retain(|s| s.timestamp >= cutoff);
        let removed = before - ring.len();
        if removed > 0 {
            info!(removed, "retention sweep dropped old snapshots");
        }
    }

    fn process_memory_mb(&self) -> f64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0.0;
        };
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }

    /// The rolling snapshot history, oldest first.
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.ring.lock().iter().cloned().collect()
    }

    /// The analysis derived in the most recent cycle.
    pub fn latest_report(&self) -> Option<AnalysisReport> {
        self.latest_report.lock().clone()
    }
}

/// Starts at 100 and subtracts for low hit ratio, high latency, and every
/// active insight, clamped to zero.
fn compute_health_score(snapshot: &MetricsSnapshot, total_reads: u64, insights: &[Insight]) -> f64 {
    let mut score = 100.0;
    if total_reads > 0 && snapshot.global_hit_ratio < 0.9 {
        score -= (0.9 - snapshot.global_hit_ratio) * 50.0;
    }
    if snapshot.avg_latency_ms > 20.0 {
        score -= (snapshot.avg_latency_ms - 20.0) * 0.5;
    }
    for insight in insights {
        score -= insight.severity.health_penalty();
    }
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(hit_ratio: f64, latency_ms: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            global_hit_ratio: hit_ratio,
            avg_latency_ms: latency_ms,
            rps: 0.0,
            error_rate: 0.0,
            memory_mb: 0.0,
        }
    }

    #[test]
    fn health_score_is_bounded() {
        let healthy = compute_health_score(&snapshot(0.99, 2.0), 100, &[]);
        assert_eq!(healthy, 100.0);

        let critical = vec![
            Insight {
                severity: Severity::Critical,
                message: String::new(),
            };
            10
        ];
        let floor = compute_health_score(&snapshot(0.01, 500.0), 100, &critical);
        assert_eq!(floor, 0.0);
    }

    #[test]
    fn health_score_penalizes_low_hit_ratio() {
        let score = compute_health_score(&snapshot(0.7, 5.0), 100, &[]);
        assert!((score - 90.0).abs() < 1e-9);
    }

    #[test]
    fn idle_process_is_healthy() {
        let score = compute_health_score(&snapshot(0.0, 0.0), 0, &[]);
        assert_eq!(score, 100.0);
    }
}
