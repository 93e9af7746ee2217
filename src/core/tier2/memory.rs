// src/core/tier2/memory.rs

//! An in-process implementation of the distributed tier.
//!
//! Backs tests and single-node deployments. Keys expire lazily on access,
//! and pub/sub is built on `tokio::sync::broadcast`, one channel per name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use wildmatch::WildMatch;

use crate::core::errors::CacheError;
use crate::core::tier2::Tier2Store;

/// The capacity of each individual broadcast channel.
const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: Bytes,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// In-memory tier-2 store with TTLs and broadcast-backed pub/sub.
#[derive(Debug)]
pub struct MemoryTier2 {
    entries: DashMap<String, StoredEntry>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    /// Fault injection switch: when false, every operation fails as if the
    /// remote store were unreachable.
    online: AtomicBool,
}

impl Default for MemoryTier2 {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTier2 {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the connection to the remote store.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Tier2Unavailable(
                "connection refused".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Tier2Store for MemoryTier2 {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.check_online()?;
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.payload.clone())),
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_online()?;
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                payload: value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.check_online()?;
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check_online()?;
        let matcher = WildMatch::new(pattern);
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.is_expired() && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, CacheError> {
        self.check_online()?;
        let receivers = self
            .channels
            .get(channel)
            .map(|sender| sender.send(payload).unwrap_or(0))
            .unwrap_or(0);
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, CacheError> {
        self.check_online()?;
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        // Lagged receivers skip ahead; dropped messages are re-derived on the
        // next cache miss, so silently discarding the error is safe.
        let stream = BroadcastStream::new(receiver).filter_map(|msg| async { msg.ok() });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<Duration, CacheError> {
        self.check_online()?;
        let started = Instant::now();
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn set_get_del_roundtrip() {
        let store = MemoryTier2::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(store.del(&["k".to_string()]).await.unwrap(), 1);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = MemoryTier2::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_filters_by_glob() {
        let store = MemoryTier2::new();
        for key in ["perm:7:chat:read", "perm:7:files:read", "perm:8:chat:read"] {
            store
                .set(key, Bytes::from_static(b"1"), None)
                .await
                .unwrap();
        }
        let mut matched = store.keys("perm:7:*").await.unwrap();
        matched.sort();
        assert_eq!(matched, vec!["perm:7:chat:read", "perm:7:files:read"]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_reaches_subscriber() {
        let store = MemoryTier2::new();
        let mut sub = store.subscribe("events").await.unwrap();
        let receivers = store
            .publish("events", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(receivers, 1);
        assert_eq!(sub.next().await, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_store_errors() {
        let store = MemoryTier2::new();
        store.set_online(false);
        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
        store.set_online(true);
        assert!(store.ping().await.is_ok());
    }
}
