// src/core/tier1.rs

//! The process-local cache tier: a concurrent, bounded, TTL-aware map.
//!
//! Every cache in the subsystem uses a `Tier1Store` as its L1. Entries carry
//! access metadata so that capacity overruns evict by last touch, and the
//! background sweeper can purge expired entries that are never read again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::core::metrics;

/// Identifies which tier satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
    Origin,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "l1"),
            CacheTier::L2 => write!(f, "l2"),
            CacheTier::Origin => write!(f, "origin"),
        }
    }
}

/// A single cached value with its bookkeeping metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    pub created_at: Instant,
    pub accessed_at: Instant,
    pub hit_count: u64,
    pub tier: CacheTier,
    pub size_bytes: Option<usize>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, tier: CacheTier, size_bytes: Option<usize>) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now + ttl,
            created_at: now,
            accessed_at: now,
            hit_count: 0,
            tier,
            size_bytes,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// A concurrent, bounded, TTL-aware map used as the local tier by every cache.
///
/// Readers never block each other; per-key mutation is serialized by the
/// underlying shard locks, which also makes get-or-evict atomic per key.
#[derive(Debug)]
pub struct Tier1Store<V> {
    name: &'static str,
    entries: DashMap<String, CacheEntry<V>>,
    max_items: usize,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> Tier1Store<V> {
    pub fn new(name: &'static str, max_items: usize) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            max_items,
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Looks up a key, refreshing its access metadata on a hit.
    /// An entry observed past its deadline is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = {
            let mut entry = self.entries.get_mut(key)?;
            if entry.is_expired() {
                true
            } else {
                entry.hit_count += 1;
                entry.accessed_at = Instant::now();
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Looks up a key together with its metadata. Access metadata is
    /// refreshed as in [`get`](Self::get).
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let expired = {
            let mut entry = self.entries.get_mut(key)?;
            if entry.is_expired() {
                true
            } else {
                entry.hit_count += 1;
                entry.accessed_at = Instant::now();
                return Some(entry.clone());
            }
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Reads a value without refreshing access metadata.
    pub fn peek(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Stores a value under the given TTL, evicting by last touch if the
    /// store grows past its bound.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration, tier: CacheTier) {
        self.entries
            .insert(key.into(), CacheEntry::new(value, ttl, tier, None));
        self.enforce_capacity();
    }

    /// Stores a value with a known payload size.
    pub fn put_sized(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
        tier: CacheTier,
        size_bytes: usize,
    ) {
        self.entries.insert(
            key.into(),
            CacheEntry::new(value, ttl, tier, Some(size_bytes)),
        );
        self.enforce_capacity();
    }

    /// Removes a single key. Returns true if the key was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every entry matched by the predicate, returning how many fell.
    /// Used by pattern invalidation.
    pub fn delete_if(&self, predicate: impl Fn(&str, &CacheEntry<V>) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| !predicate(k, v));
        before.saturating_sub(self.entries.len())
    }

    /// Removes all expired entries. Runs on the sweeper cadence.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            metrics::SWEPT_KEYS_TOTAL.inc_by(removed as f64);
            debug!(
                store = self.name,
                removed, "sweeper purged expired entries"
            );
        }
        removed
    }

    /// Caps every entry's remaining TTL. Used by critical invalidation events
    /// to bound staleness without dropping the working set.
    pub fn clamp_ttl(&self, max_ttl: Duration) {
        let deadline = Instant::now() + max_ttl;
        for mut entry in self.entries.iter_mut() {
            if entry.expires_at > deadline {
                entry.expires_at = deadline;
            }
        }
    }

    /// Evicts least-recently-touched entries until the store is within bounds.
    fn enforce_capacity(&self) {
        while self.entries.len() > self.max_items {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.accessed_at)
                .map(|e| (e.key().clone(), e.accessed_at));
            let Some((key, accessed_at)) = victim else {
                break;
            };
            // Only evict if the entry was not touched since it was chosen.
            if self
                .entries
                .remove_if(&key, |_, e| e.accessed_at == accessed_at)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::EVICTIONS_TOTAL.inc();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Visits every live entry. The callback must not touch the store.
    pub fn for_each(&self, mut f: impl FnMut(&str, &CacheEntry<V>)) {
        for entry in self.entries.iter() {
            if !entry.is_expired() {
                f(entry.key(), entry.value());
            }
        }
    }
}

/// Object-safe handle used by the background sweeper and the metrics
/// aggregator, erasing the stored value type.
pub trait LocalTier: Send + Sync {
    fn sweep_expired(&self) -> usize;
    fn store_name(&self) -> &'static str;
    fn eviction_count(&self) -> u64;
    fn item_count(&self) -> usize;
}

impl<V: Clone + Send + Sync + 'static> LocalTier for Tier1Store<V> {
    fn sweep_expired(&self) -> usize {
        self.sweep()
    }

    fn store_name(&self) -> &'static str {
        self.name
    }

    fn eviction_count(&self) -> u64 {
        self.eviction_count()
    }

    fn item_count(&self) -> usize {
        self.len()
    }
}
