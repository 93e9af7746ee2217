// src/config.rs

//! Manages subsystem configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Tiered TTL and capacity settings for one cache profile.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct CacheProfile {
    /// Time-to-live for entries in the process-local tier.
    #[serde(with = "humantime_serde", default = "default_t1_ttl")]
    pub t1_ttl: Duration,
    /// Time-to-live for entries in the distributed tier.
    #[serde(with = "humantime_serde", default = "default_t2_ttl")]
    pub t2_ttl: Duration,
    /// Maximum number of entries held in the local tier before eviction.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_t1_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_t2_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_max_items() -> usize {
    10_000
}

impl CacheProfile {
    pub const fn new(t1_ttl: Duration, t2_ttl: Duration, max_items: usize) -> Self {
        Self {
            t1_ttl,
            t2_ttl,
            max_items,
        }
    }

    /// Profile used for short-lived user sessions.
    pub const fn session() -> Self {
        Self::new(
            Duration::from_secs(5 * 60),
            Duration::from_secs(30 * 60),
            10_000,
        )
    }

    /// Profile used for authorization decisions.
    pub const fn rbac() -> Self {
        Self::new(
            Duration::from_secs(15 * 60),
            Duration::from_secs(60 * 60),
            5_000,
        )
    }

    /// Profile used for memoized query results.
    pub const fn query() -> Self {
        Self::new(
            Duration::from_secs(2 * 60),
            Duration::from_secs(10 * 60),
            20_000,
        )
    }
}

/// Per-workload cache profiles.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProfilesConfig {
    #[serde(default = "CacheProfile::session")]
    pub session: CacheProfile,
    #[serde(default = "CacheProfile::rbac")]
    pub rbac: CacheProfile,
    #[serde(default = "CacheProfile::query")]
    pub query: CacheProfile,
    /// Cap on the query cache's promoted local working set.
    #[serde(default = "default_query_working_set")]
    pub query_working_set: usize,
}

fn default_query_working_set() -> usize {
    1_000
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            session: CacheProfile::session(),
            rbac: CacheProfile::rbac(),
            query: CacheProfile::query(),
            query_working_set: default_query_working_set(),
        }
    }
}

/// Settings for the invalidation event pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InvalidationConfig {
    /// Number of batched events that forces an immediate flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum age of a batched event before it is flushed.
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Capacity of the bounded event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// If true, producers drop events (with a warning) instead of blocking
    /// when the channel is full.
    #[serde(default)]
    pub drop_when_full: bool,
}

fn default_batch_size() -> usize {
    100
}
fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_channel_capacity() -> usize {
    1_000
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            channel_capacity: default_channel_capacity(),
            drop_when_full: false,
        }
    }
}

/// A query warmed on startup and on every warm-up cycle.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FrequentQuery {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// Settings for the periodic cache warmer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WarmerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run a warm-up pass immediately at startup.
    #[serde(default = "default_true")]
    pub warm_on_startup: bool,
    #[serde(with = "humantime_serde", default = "default_warmer_interval")]
    pub interval: Duration,
    /// Hard deadline for a single warm-up cycle.
    #[serde(with = "humantime_serde", default = "default_warmer_timeout")]
    pub timeout: Duration,
    /// Maximum number of concurrent warm-up tasks per category.
    #[serde(default = "default_warmer_concurrency")]
    pub concurrency: usize,
    /// TTL applied to warmed entries.
    #[serde(with = "humantime_serde", default = "default_warmer_ttl")]
    pub ttl: Duration,
    /// Users whose sessions are pre-populated.
    #[serde(default = "default_warm_users")]
    pub user_ids: Vec<u64>,
    /// Roles whose permission sets are pre-populated.
    #[serde(default = "default_warm_roles")]
    pub roles: Vec<String>,
    /// Queries pre-executed and cached on every cycle.
    #[serde(default = "default_frequent_queries")]
    pub frequent_queries: Vec<FrequentQuery>,
}

fn default_true() -> bool {
    true
}
fn default_warmer_interval() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_warmer_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_warmer_concurrency() -> usize {
    5
}
fn default_warmer_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_warm_users() -> Vec<u64> {
    (1..=5).collect()
}
fn default_warm_roles() -> Vec<String> {
    ["user", "moderator", "admin", "super"]
        .iter()
        .map(|r| r.to_string())
        .collect()
}
fn default_frequent_queries() -> Vec<FrequentQuery> {
    vec![
        FrequentQuery {
            sql: "SELECT * FROM users WHERE status = 'active'".into(),
            params: vec![],
        },
        FrequentQuery {
            sql: "SELECT COUNT(*) FROM user_sessions WHERE expires_at > NOW()".into(),
            params: vec![],
        },
        FrequentQuery {
            sql: "SELECT * FROM rooms WHERE is_public = true LIMIT 50".into(),
            params: vec![],
        },
    ]
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warm_on_startup: true,
            interval: default_warmer_interval(),
            timeout: default_warmer_timeout(),
            concurrency: default_warmer_concurrency(),
            ttl: default_warmer_ttl(),
            user_ids: default_warm_users(),
            roles: default_warm_roles(),
            frequent_queries: default_frequent_queries(),
        }
    }
}

/// Settings for the metrics aggregation loop.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(with = "humantime_serde", default = "default_metrics_interval")]
    pub interval: Duration,
    /// Snapshots older than this are removed by the daily sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_retention_days() -> u32 {
    7
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: default_metrics_interval(),
            retention_days: default_retention_days(),
        }
    }
}

/// Alerting thresholds evaluated by the metrics aggregator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AlertsConfig {
    #[serde(default = "default_min_hit_ratio")]
    pub min_hit_ratio: f64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_min_hit_ratio() -> f64 {
    0.80
}
fn default_max_latency_ms() -> f64 {
    50.0
}
fn default_max_error_rate() -> f64 {
    0.01
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            min_hit_ratio: default_min_hit_ratio(),
            max_latency_ms: default_max_latency_ms(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

/// The root configuration for the caching subsystem.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub warmer: WarmerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    /// An invalid configuration is fatal; the subsystem refuses to start.
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in [
            ("session", &self.profiles.session),
            ("rbac", &self.profiles.rbac),
            ("query", &self.profiles.query),
        ] {
            if profile.max_items == 0 {
                return Err(anyhow!("profiles.{name}.max_items cannot be 0"));
            }
            if profile.t1_ttl.is_zero() || profile.t2_ttl.is_zero() {
                return Err(anyhow!("profiles.{name} TTLs cannot be 0"));
            }
        }
        if self.profiles.query_working_set == 0 {
            return Err(anyhow!("profiles.query_working_set cannot be 0"));
        }
        if self.invalidation.batch_size == 0 {
            return Err(anyhow!("invalidation.batch_size cannot be 0"));
        }
        if self.invalidation.channel_capacity == 0 {
            return Err(anyhow!("invalidation.channel_capacity cannot be 0"));
        }
        if self.invalidation.flush_interval.is_zero() {
            return Err(anyhow!("invalidation.flush_interval cannot be 0"));
        }
        if self.warmer.concurrency == 0 {
            return Err(anyhow!("warmer.concurrency cannot be 0"));
        }
        if self.warmer.timeout > self.warmer.interval {
            warn!(
                "warmer.timeout ({:?}) exceeds warmer.interval ({:?}); cycles may overlap",
                self.warmer.timeout, self.warmer.interval
            );
        }
        if self.metrics.interval.is_zero() {
            return Err(anyhow!("metrics.interval cannot be 0"));
        }
        if self.metrics.retention_days == 0 {
            return Err(anyhow!("metrics.retention_days cannot be 0"));
        }
        if !(0.0..=1.0).contains(&self.alerts.min_hit_ratio) {
            return Err(anyhow!("alerts.min_hit_ratio must be within [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&self.alerts.max_error_rate) {
            return Err(anyhow!("alerts.max_error_rate must be within [0.0, 1.0]"));
        }
        if self.alerts.max_latency_ms <= 0.0 {
            return Err(anyhow!("alerts.max_latency_ms must be positive"));
        }
        Ok(())
    }
}
