// src/core/session.rs

//! Typed facade over the session-profile multi-level cache.
//!
//! Sessions are written by the auth layer at login/refresh and invalidated
//! through the invalidation pipeline on logout or profile change.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheProfile;
use crate::core::errors::CacheError;
use crate::core::keys;
use crate::core::multi_level::MultiLevelCache;
use crate::core::tier1::CacheTier;
use crate::core::tier2::Tier2Store;

/// Caches serialized user profiles under `user_session:{user_id}`.
pub struct SessionCache {
    inner: Arc<MultiLevelCache>,
}

impl SessionCache {
    pub fn new(profile: CacheProfile, t2: Arc<dyn Tier2Store>) -> Self {
        Self {
            inner: Arc::new(MultiLevelCache::new("session", profile, t2)),
        }
    }

    /// Stores a user's session payload in both tiers.
    pub async fn set_user_session<T: Serialize>(
        &self,
        user_id: u64,
        profile: &T,
    ) -> Result<(), CacheError> {
        self.inner.set(&keys::session_key(user_id), profile).await
    }

    /// Fetches a user's session payload, reporting the serving tier.
    pub async fn get_user_session<T: DeserializeOwned>(
        &self,
        user_id: u64,
    ) -> Option<(T, CacheTier)> {
        self.inner
            .get_with_tier(&keys::session_key(user_id))
            .await
    }

    /// Drops a user's session from both tiers.
    pub async fn invalidate_session(&self, user_id: u64) -> Result<(), CacheError> {
        self.inner.invalidate(&keys::session_key(user_id)).await
    }

    /// The underlying multi-level cache, shared with the invalidation
    /// pipeline and the background tasks.
    pub fn cache(&self) -> Arc<MultiLevelCache> {
        Arc::clone(&self.inner)
    }
}
