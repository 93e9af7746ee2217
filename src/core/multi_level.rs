// src/core/multi_level.rs

//! Orchestrates reads and writes across the local and distributed tiers.
//!
//! Reads check T1 first, fall back to T2 and write the payload through to
//! T1 on a hit. A full miss returns absent; the multi-level cache never
//! calls an origin. Writes serialize once and fan out to both tiers, with
//! T1 authoritative for the current process: a T2 failure is logged and
//! never surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::config::CacheProfile;
use crate::core::errors::CacheError;
use crate::core::metrics;
use crate::core::stats::CacheStats;
use crate::core::tier1::{CacheTier, Tier1Store};
use crate::core::tier2::Tier2Store;

/// A two-tier cache for one workload profile. T1 holds the serialized
/// payload so that a write serializes exactly once for both tiers.
pub struct MultiLevelCache {
    name: &'static str,
    profile: CacheProfile,
    t1: Arc<Tier1Store<Bytes>>,
    t2: Arc<dyn Tier2Store>,
    stats: Arc<CacheStats>,
}

impl MultiLevelCache {
    pub fn new(name: &'static str, profile: CacheProfile, t2: Arc<dyn Tier2Store>) -> Self {
        Self {
            name,
            profile,
            t1: Arc::new(Tier1Store::new(name, profile.max_items)),
            t2,
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Tiered lookup: T1, then T2 with write-through promotion.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_tier(key).await.map(|(value, _)| value)
    }

    /// Tiered lookup that also reports which tier satisfied it.
    pub async fn get_with_tier<T: DeserializeOwned>(&self, key: &str) -> Option<(T, CacheTier)> {
        let started = Instant::now();
        if let Some(payload) = self.t1.get(key) {
            match serde_json::from_slice(&payload) {
                Ok(value) => {
                    self.stats.record_l1_hit();
                    self.stats.record_latency(started.elapsed());
                    metrics::CACHE_HITS_TOTAL
                        .with_label_values(&[self.name, "l1"])
                        .inc();
                    return Some((value, CacheTier::L1));
                }
                Err(e) => {
                    // Undecodable payloads are dropped and treated as misses.
                    warn!(cache = self.name, key, "discarding undecodable T1 entry: {e}");
                    self.t1.delete(key);
                }
            }
        }

        let payload = match self.t2.get(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.record_miss(started);
                return None;
            }
            Err(e) => {
                debug!(cache = self.name, key, "T2 read failed, treating as miss: {e}");
                self.stats.record_error();
                self.record_miss(started);
                return None;
            }
        };

        match serde_json::from_slice(&payload) {
            Ok(value) => {
                self.t1
                    .put(key, payload, self.profile.t1_ttl, CacheTier::L2);
                self.stats.record_l2_hit();
                self.stats.record_latency(started.elapsed());
                metrics::CACHE_HITS_TOTAL
                    .with_label_values(&[self.name, "l2"])
                    .inc();
                Some((value, CacheTier::L2))
            }
            Err(e) => {
                warn!(cache = self.name, key, "discarding undecodable T2 entry: {e}");
                self.record_miss(started);
                None
            }
        }
    }

    /// Serializes once and writes both tiers with the profile TTLs.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.set_with_ttl(key, value, self.profile.t1_ttl, self.profile.t2_ttl)
            .await
    }

    /// Write-through with explicit per-tier TTLs (used by the warmer).
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        t1_ttl: Duration,
        t2_ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        self.t1.put(key, payload.clone(), t1_ttl, CacheTier::L1);
        if let Err(e) = self.t2.set(key, payload, Some(t2_ttl)).await {
            warn!(cache = self.name, key, "T2 write failed: {e}");
            self.stats.record_error();
        }
        self.stats.record_write();
        Ok(())
    }

    /// Deletes a key from both tiers in parallel.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.t1.delete(key);
        let doomed = [key.to_string()];
        if let Err(e) = self.t2.del(&doomed).await {
            warn!(cache = self.name, key, "T2 delete failed: {e}");
            self.stats.record_error();
            return Err(e);
        }
        Ok(())
    }

    /// Deletes every key matching a glob pattern from both tiers.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher = WildMatch::new(pattern);
        let local = self.t1.delete_if(|k, _| matcher.matches(k));

        let remote = match self.t2.keys(pattern).await {
            Ok(keys) if !keys.is_empty() => self.t2.del(&keys).await?,
            Ok(_) => 0,
            Err(e) => {
                warn!(cache = self.name, pattern, "T2 pattern scan failed: {e}");
                self.stats.record_error();
                return Err(e);
            }
        };
        debug!(
            cache = self.name,
            pattern, local, remote, "pattern invalidation complete"
        );
        Ok(local + remote as usize)
    }

    /// Caps the remaining TTL of every local entry. T2 entries keep their
    /// own TTLs and age out on schedule.
    pub fn expire_all(&self, max_ttl: Duration) {
        self.t1.clamp_ttl(max_ttl);
        debug!(cache = self.name, ?max_ttl, "clamped local TTLs");
    }

    fn record_miss(&self, started: Instant) {
        self.stats.record_miss();
        self.stats.record_latency(started.elapsed());
        metrics::CACHE_MISSES_TOTAL
            .with_label_values(&[self.name])
            .inc();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn profile(&self) -> &CacheProfile {
        &self.profile
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Handle to the local tier, for sweeper registration and inspection.
    pub fn tier1(&self) -> Arc<Tier1Store<Bytes>> {
        Arc::clone(&self.t1)
    }
}
