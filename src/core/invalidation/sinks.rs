// src/core/invalidation/sinks.rs

//! Capability handles the invalidation manager uses to reach each cache.
//!
//! Each cache hands the manager a small sink at construction time, so the
//! manager never holds a back-reference to a concrete cache type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::errors::CacheError;
use crate::core::query::QueryResultCache;
use crate::core::rbac::RbacCache;
use crate::core::session::SessionCache;

/// The invalidation capabilities a cache exposes to the manager.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    fn cache_name(&self) -> &'static str;

    /// Removes one exact key from both tiers.
    async fn invalidate_key(&self, key: &str) -> Result<(), CacheError>;

    /// Removes every key matching a glob from both tiers.
    async fn invalidate_glob(&self, pattern: &str) -> Result<(), CacheError>;

    /// Removes every entry derived from a table. Only meaningful for the
    /// query cache; other caches ignore it.
    async fn invalidate_table(&self, _table: &str) -> Result<(), CacheError> {
        Ok(())
    }

    /// Clamps remaining local TTLs. Used by critical events.
    fn expire_all(&self, max_ttl: Duration);
}

pub struct SessionSink(pub Arc<SessionCache>);

#[async_trait]
impl InvalidationSink for SessionSink {
    fn cache_name(&self) -> &'static str {
        "session"
    }

    async fn invalidate_key(&self, key: &str) -> Result<(), CacheError> {
        self.0.cache().invalidate(key).await
    }

    async fn invalidate_glob(&self, pattern: &str) -> Result<(), CacheError> {
        self.0.cache().invalidate_pattern(pattern).await.map(|_| ())
    }

    fn expire_all(&self, max_ttl: Duration) {
        self.0.cache().expire_all(max_ttl);
    }
}

pub struct RbacSink(pub Arc<RbacCache>);

#[async_trait]
impl InvalidationSink for RbacSink {
    fn cache_name(&self) -> &'static str {
        "rbac"
    }

    async fn invalidate_key(&self, key: &str) -> Result<(), CacheError> {
        self.0.invalidate_matching(key).await
    }

    async fn invalidate_glob(&self, pattern: &str) -> Result<(), CacheError> {
        self.0.invalidate_matching(pattern).await
    }

    fn expire_all(&self, max_ttl: Duration) {
        self.0.expire_all(max_ttl);
    }
}

pub struct QuerySink(pub Arc<QueryResultCache>);

#[async_trait]
impl InvalidationSink for QuerySink {
    fn cache_name(&self) -> &'static str {
        "query"
    }

    async fn invalidate_key(&self, key: &str) -> Result<(), CacheError> {
        self.0.invalidate_matching(key).await.map(|_| ())
    }

    async fn invalidate_glob(&self, pattern: &str) -> Result<(), CacheError> {
        self.0.invalidate_matching(pattern).await.map(|_| ())
    }

    async fn invalidate_table(&self, table: &str) -> Result<(), CacheError> {
        self.0.invalidate_table(table).await.map(|_| ())
    }

    fn expire_all(&self, max_ttl: Duration) {
        self.0.expire_all(max_ttl);
    }
}
