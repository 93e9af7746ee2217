// src/core/tier2/mod.rs

//! The distributed cache tier, behind a client trait.
//!
//! Production deployments back this with Redis or a compatible store; the
//! in-process [`memory::MemoryTier2`] implementation serves tests and
//! single-node deployments. All payloads are raw bytes; serialization is
//! the caller's concern.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::core::errors::CacheError;

pub mod memory;

pub use memory::MemoryTier2;

/// Client contract for the distributed tier.
///
/// Every method may suspend and is expected to respect the caller's
/// deadline. Failures surface as [`CacheError::Tier2Unavailable`] and are
/// treated as misses by the caches.
#[async_trait]
pub trait Tier2Store: Send + Sync {
    /// Fetches the payload stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Stores `value` under `key`. `None` means no expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Deletes the given keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Lists keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Publishes a payload to a channel, returning the subscriber count.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, CacheError>;

    /// Subscribes to a channel, yielding raw payloads.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, CacheError>;

    /// Round-trip health probe. Returns the observed latency.
    async fn ping(&self) -> Result<Duration, CacheError>;
}
