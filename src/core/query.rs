// src/core/query.rs

//! Memoizes database query results keyed by a fingerprint of the
//! normalized SQL and its parameters.
//!
//! TTLs, local-tier placement, and payload compression are driven by an
//! ordered pattern table matched against the normalized SQL. Frequently
//! accessed queries are promoted into a bounded local working set.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::config::CacheProfile;
use crate::core::errors::CacheError;
use crate::core::keys;
use crate::core::metrics;
use crate::core::stats::CacheStats;
use crate::core::tier1::{CacheTier, Tier1Store};
use crate::core::tier2::Tier2Store;

/// How many queries the periodic analysis marks as hot.
const HOT_TOP_N: usize = 10;
/// Queries accessed more often than this are promoted to T1 on a T2 hit.
const ACCESS_PROMOTION_THRESHOLD: u64 = 10;

/// TTL, placement, and compression settings for one class of query.
#[derive(Debug, Clone, Copy)]
pub struct QueryPattern {
    pub name: &'static str,
    /// Matched as a substring of the normalized (uppercased) SQL.
    pub fragment: &'static str,
    pub ttl: Duration,
    pub use_local: bool,
    pub compress: bool,
}

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Fallback for queries that match no known fragment.
pub static DEFAULT_PATTERN: QueryPattern = QueryPattern {
    name: "default",
    fragment: "",
    ttl: minutes(10),
    use_local: false,
    compress: false,
};

/// The ordered pattern table. First match wins.
static QUERY_PATTERNS: Lazy<Vec<QueryPattern>> = Lazy::new(|| {
    vec![
        QueryPattern {
            name: "user_profile",
            fragment: "SELECT * FROM USERS WHERE",
            ttl: minutes(15),
            use_local: true,
            compress: false,
        },
        QueryPattern {
            name: "user_sessions",
            fragment: "SELECT * FROM USER_SESSIONS WHERE",
            ttl: minutes(5),
            use_local: true,
            compress: false,
        },
        QueryPattern {
            name: "chat_messages",
            fragment: "SELECT * FROM MESSAGES WHERE",
            ttl: minutes(2),
            use_local: false,
            compress: true,
        },
        QueryPattern {
            name: "user_permissions",
            fragment: "SELECT * FROM USER_PERMISSIONS WHERE",
            ttl: minutes(30),
            use_local: true,
            compress: false,
        },
        QueryPattern {
            name: "room_members",
            fragment: "SELECT * FROM ROOM_MEMBERS WHERE",
            ttl: minutes(10),
            use_local: true,
            compress: false,
        },
        QueryPattern {
            name: "file_metadata",
            fragment: "SELECT * FROM FILES WHERE",
            ttl: minutes(60),
            use_local: false,
            compress: true,
        },
        QueryPattern {
            name: "analytics_count",
            fragment: "SELECT COUNT(*) FROM",
            ttl: minutes(5),
            use_local: false,
            compress: false,
        },
    ]
});

/// A memoized query result with its execution and access metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuery {
    /// The normalized SQL text.
    pub sql: String,
    pub params: Vec<Value>,
    pub result: Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// How long the executor took, used for savings accounting.
    pub exec_ms: u64,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub hot: bool,
}

impl CachedQuery {
    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// The outcome of [`QueryResultCache::execute_with_cache`].
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub result: Value,
    pub from_cache: bool,
    pub from_local: bool,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct AccessStat {
    count: u64,
    last_access: Option<DateTime<Utc>>,
}

/// Collapses all whitespace to single spaces, uppercases, and trims.
///
/// Note: every token is uppercased, string literals included, so callers
/// that re-case literals produce a different fingerprint.
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// 128-bit digest over the normalized SQL and serialized parameters,
/// hex-encoded to 32 characters.
pub fn fingerprint(normalized_sql: &str, params: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_sql.as_bytes());
    hasher.update(serde_json::to_vec(params).unwrap_or_default());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Finds the first pattern whose fragment appears in the normalized SQL.
pub fn match_pattern(normalized_sql: &str) -> &'static QueryPattern {
    QUERY_PATTERNS
        .iter()
        .find(|p| normalized_sql.contains(p.fragment))
        .unwrap_or(&DEFAULT_PATTERN)
}

/// The query result cache.
pub struct QueryResultCache {
    profile: CacheProfile,
    working_set: Arc<Tier1Store<CachedQuery>>,
    t2: Arc<dyn Tier2Store>,
    access: DashMap<String, AccessStat>,
    hot: RwLock<HashSet<String>>,
    stats: Arc<CacheStats>,
    saved_exec_ms: AtomicU64,
}

impl QueryResultCache {
    pub fn new(profile: CacheProfile, working_set_max: usize, t2: Arc<dyn Tier2Store>) -> Self {
        Self {
            profile,
            working_set: Arc::new(Tier1Store::new("query", working_set_max)),
            t2,
            access: DashMap::new(),
            hot: RwLock::new(HashSet::new()),
            stats: Arc::new(CacheStats::new()),
            saved_exec_ms: AtomicU64::new(0),
        }
    }

    /// Memoizing query execution.
    ///
    /// Two calls whose normalized SQL and parameters are identical compute
    /// the same key and share a cached result within its TTL. On a miss the
    /// executor runs and its result is written through asynchronously.
    pub async fn execute_with_cache<F, Fut>(
        &self,
        sql: &str,
        params: &[Value],
        executor: F,
    ) -> Result<QueryOutcome, CacheError>
    where
        F: FnOnce(String, Vec<Value>) -> Fut,
        Fut: Future<Output = Result<Value, CacheError>>,
    {
        let started = Instant::now();
        let normalized = normalize_sql(sql);
        let key = keys::query_key(&fingerprint(&normalized, params));
        let pattern = match_pattern(&normalized);

        if let Some(record) = self.working_set.get(&key) {
            if !record.is_expired() {
                let count = self.record_access(&key);
                self.saved_exec_ms.fetch_add(record.exec_ms, Ordering::Relaxed);
                self.stats.record_l1_hit();
                self.stats.record_latency(started.elapsed());
                metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["query", "l1"])
                    .inc();
                debug!(key = %key, count, pattern = pattern.name, "query served locally");
                return Ok(QueryOutcome {
                    result: record.result,
                    from_cache: true,
                    from_local: true,
                    key,
                });
            }
            self.working_set.delete(&key);
        }

        match self.fetch_remote(&key, pattern).await {
            Some(record) => {
                let count = self.record_access(&key);
                if pattern.use_local || count > ACCESS_PROMOTION_THRESHOLD || self.is_hot(&key) {
                    self.promote(&key, record.clone(), pattern);
                }
                self.saved_exec_ms.fetch_add(record.exec_ms, Ordering::Relaxed);
                self.stats.record_l2_hit();
                self.stats.record_latency(started.elapsed());
                metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["query", "l2"])
                    .inc();
                Ok(QueryOutcome {
                    result: record.result,
                    from_cache: true,
                    from_local: false,
                    key,
                })
            }
            None => {
                let exec_started = Instant::now();
                let result = executor(sql.to_string(), params.to_vec()).await?;
                let exec_ms = exec_started.elapsed().as_millis() as u64;

                let now = Utc::now();
                let record = CachedQuery {
                    sql: normalized,
                    params: params.to_vec(),
                    result: result.clone(),
                    cached_at: now,
                    expires_at: now + pattern.ttl,
                    exec_ms,
                    size_bytes: 0,
                    access_count: 1,
                    last_access: now,
                    hot: self.is_hot(&key),
                };
                self.record_access(&key);
                if pattern.use_local {
                    self.promote(&key, record.clone(), pattern);
                }
                self.write_back(key.clone(), record, pattern);

                self.stats.record_miss();
                self.stats.record_latency(started.elapsed());
                metrics::CACHE_MISSES_TOTAL
                    .with_label_values(&["query"])
                    .inc();
                Ok(QueryOutcome {
                    result,
                    from_cache: false,
                    from_local: false,
                    key,
                })
            }
        }
    }

    /// Fetches and decodes a record from T2, honoring its embedded expiry.
    async fn fetch_remote(&self, key: &str, pattern: &QueryPattern) -> Option<CachedQuery> {
        let payload = match self.t2.get(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                debug!(key = %key, "T2 query read failed: {e}");
                self.stats.record_error();
                return None;
            }
        };
        let record = match decode_record(&payload, pattern.compress) {
            Some(record) => record,
            None => {
                warn!(key = %key, "discarding undecodable query record");
                return None;
            }
        };
        if record.is_expired() {
            let doomed = [key.to_string()];
            let _ = self.t2.del(&doomed).await;
            return None;
        }
        Some(record)
    }

    /// Stores a record in the local working set with the tighter of the
    /// pattern TTL and the profile's local TTL.
    fn promote(&self, key: &str, record: CachedQuery, pattern: &QueryPattern) {
        let size = record.size_bytes;
        let ttl = pattern.ttl.min(self.profile.t1_ttl);
        self.working_set
            .put_sized(key, record, ttl, CacheTier::L1, size);
    }

    /// Serializes (and optionally compresses) a record and writes it to T2
    /// off the request path.
    fn write_back(&self, key: String, mut record: CachedQuery, pattern: &'static QueryPattern) {
        let t2 = Arc::clone(&self.t2);
        tokio::spawn(async move {
            let payload = match encode_record(&mut record, pattern.compress) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(key = %key, "query record did not serialize: {e}");
                    return;
                }
            };
            if let Err(e) = t2.set(&key, payload, Some(pattern.ttl)).await {
                debug!(key = %key, "query write-back failed: {e}");
            }
        });
    }

    fn record_access(&self, key: &str) -> u64 {
        let mut stat = self.access.entry(key.to_string()).or_default();
        stat.count += 1;
        stat.last_access = Some(Utc::now());
        stat.count
    }

    fn is_hot(&self, key: &str) -> bool {
        self.hot.read().contains(key)
    }

    /// Ranks cached queries by access count (most recent access breaking
    /// ties) and marks the top entries hot, so their next T2 hit lands in
    /// the working set. Runs every 5 minutes.
    pub fn analyze_hot_queries(&self) -> usize {
        let mut ranked: Vec<(String, AccessStat)> = self
            .access
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.count
                .cmp(&a.1.count)
                .then(b.1.last_access.cmp(&a.1.last_access))
        });
        ranked.truncate(HOT_TOP_N);

        let mut hot = self.hot.write();
        hot.clear();
        hot.extend(ranked.into_iter().map(|(k, _)| k));
        let count = hot.len();
        drop(hot);

        debug!(count, "hot query set refreshed");
        count
    }

    /// The most-accessed query keys, for hot-spot reporting.
    pub fn top_queries(&self, n: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<(String, u64)> = self
            .access
            .iter()
            .map(|e| (e.key().clone(), e.value().count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(n);
        ranked
    }

    /// Executes a query unconditionally and caches the result with an
    /// explicit TTL. Used by the warmer to pre-populate frequent queries.
    pub async fn warm_query<F, Fut>(
        &self,
        sql: &str,
        params: &[Value],
        executor: F,
        ttl: Duration,
    ) -> Result<(), CacheError>
    where
        F: FnOnce(String, Vec<Value>) -> Fut,
        Fut: Future<Output = Result<Value, CacheError>>,
    {
        let normalized = normalize_sql(sql);
        let key = keys::query_key(&fingerprint(&normalized, params));
        let pattern = match_pattern(&normalized);

        let exec_started = Instant::now();
        let result = executor(sql.to_string(), params.to_vec()).await?;
        let exec_ms = exec_started.elapsed().as_millis() as u64;

        let now = Utc::now();
        let mut record = CachedQuery {
            sql: normalized,
            params: params.to_vec(),
            result,
            cached_at: now,
            expires_at: now + ttl,
            exec_ms,
            size_bytes: 0,
            access_count: 0,
            last_access: now,
            hot: false,
        };
        let payload = encode_record(&mut record, pattern.compress)?;
        if pattern.use_local {
            self.promote(&key, record, pattern);
        }
        self.t2.set(&key, payload, Some(ttl)).await?;
        self.stats.record_write();
        Ok(())
    }

    /// Deletes every cached query whose SQL mentions the table, from both
    /// tiers. Matching is a case-insensitive substring test over the stored
    /// normalized SQL.
    pub async fn invalidate_table(&self, table: &str) -> Result<usize, CacheError> {
        let needle = table.to_uppercase();
        let removed_local = self
            .working_set
            .delete_if(|_, entry| entry.value.sql.contains(&needle));

        let mut removed_remote = 0;
        let candidates = self.t2.keys(&format!("{}*", keys::QUERY_PREFIX)).await?;
        let mut doomed = Vec::new();
        for key in candidates {
            if let Ok(Some(payload)) = self.t2.get(&key).await {
                if let Some(record) = decode_any(&payload) {
                    if record.sql.contains(&needle) {
                        doomed.push(key);
                    }
                }
            }
        }
        if !doomed.is_empty() {
            removed_remote = self.t2.del(&doomed).await? as usize;
            for key in &doomed {
                self.access.remove(key);
                self.hot.write().remove(key);
            }
        }
        debug!(
            table,
            removed_local, removed_remote, "table invalidation complete"
        );
        Ok(removed_local + removed_remote)
    }

    /// Deletes every cached query whose key matches the glob, from both tiers.
    pub async fn invalidate_matching(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher = WildMatch::new(pattern);
        let removed_local = self.working_set.delete_if(|k, _| matcher.matches(k));

        let doomed = self.t2.keys(pattern).await?;
        let removed_remote = if doomed.is_empty() {
            0
        } else {
            self.t2.del(&doomed).await? as usize
        };
        for key in &doomed {
            self.access.remove(key);
            self.hot.write().remove(key);
        }
        Ok(removed_local + removed_remote)
    }

    /// Caps the remaining TTL of every working-set entry.
    pub fn expire_all(&self, max_ttl: Duration) {
        self.working_set.clamp_ttl(max_ttl);
    }

    /// Total executor time avoided by cache hits, in milliseconds.
    pub fn saved_exec_ms(&self) -> u64 {
        self.saved_exec_ms.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn working_set_store(&self) -> Arc<Tier1Store<CachedQuery>> {
        Arc::clone(&self.working_set)
    }
}

fn encode_record(record: &mut CachedQuery, compress: bool) -> Result<Bytes, CacheError> {
    let json = serde_json::to_vec(record)?;
    record.size_bytes = json.len();
    if compress {
        let compressed =
            zstd::encode_all(json.as_slice(), 0).map_err(|e| CacheError::Internal(e.to_string()))?;
        Ok(Bytes::from(compressed))
    } else {
        Ok(Bytes::from(json))
    }
}

fn decode_record(payload: &[u8], compressed: bool) -> Option<CachedQuery> {
    if compressed {
        let json = zstd::decode_all(payload).ok()?;
        serde_json::from_slice(&json).ok()
    } else {
        serde_json::from_slice(payload).ok()
    }
}

/// Decodes a record of unknown framing: plain JSON first, then zstd.
fn decode_any(payload: &[u8]) -> Option<CachedQuery> {
    decode_record(payload, false).or_else(|| decode_record(payload, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_uppercases() {
        assert_eq!(
            normalize_sql("  select *\n  from users\twhere id = $1  "),
            "SELECT * FROM USERS WHERE ID = $1"
        );
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let params = vec![Value::from(1), Value::from("ada")];
        let a = fingerprint("SELECT * FROM USERS WHERE ID = $1", &params);
        let b = fingerprint("SELECT * FROM USERS WHERE ID = $1", &params);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn fingerprint_varies_with_params() {
        let a = fingerprint("SELECT * FROM USERS WHERE ID = $1", &[Value::from(1)]);
        let b = fingerprint("SELECT * FROM USERS WHERE ID = $1", &[Value::from(2)]);
        assert_ne!(a, b);
    }

    #[test]
    fn pattern_table_is_ordered() {
        assert_eq!(
            match_pattern("SELECT * FROM USERS WHERE ID = $1").name,
            "user_profile"
        );
        assert_eq!(
            match_pattern("SELECT * FROM USER_SESSIONS WHERE TOKEN = $1").name,
            "user_sessions"
        );
        assert_eq!(
            match_pattern("SELECT COUNT(*) FROM EVENTS").name,
            "analytics_count"
        );
        assert_eq!(match_pattern("SELECT 1").name, "default");
    }

    #[test]
    fn compressed_roundtrip() {
        let now = Utc::now();
        let mut record = CachedQuery {
            sql: "SELECT * FROM MESSAGES WHERE ROOM_ID = $1".into(),
            params: vec![Value::from(9)],
            result: serde_json::json!([{"id": 1, "body": "hello"}]),
            cached_at: now,
            expires_at: now + Duration::from_secs(120),
            exec_ms: 12,
            size_bytes: 0,
            access_count: 1,
            last_access: now,
            hot: false,
        };
        let payload = encode_record(&mut record, true).unwrap();
        let decoded = decode_record(&payload, true).unwrap();
        assert_eq!(decoded.sql, record.sql);
        assert_eq!(decoded.result, record.result);
        assert!(decode_any(&payload).is_some());
    }
}
