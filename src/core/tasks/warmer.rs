// src/core/tasks/warmer.rs

//! Pre-populates frequently read keys at startup and on a fixed cadence:
//! active-user sessions, baseline role permission sets, and a configured
//! list of frequent queries.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::WarmerConfig;
use crate::core::errors::CacheError;
use crate::core::keys;
use crate::core::query::QueryResultCache;
use crate::core::rbac::RbacCache;
use crate::core::session::SessionCache;

/// Supplies origin data for warm-up: user profiles and query execution.
/// Implemented by the embedding service against its real data stores.
#[async_trait]
pub trait OriginSource: Send + Sync {
    /// Loads a user's profile, or `None` if the user does not exist.
    async fn fetch_user_profile(&self, user_id: u64) -> Option<Value>;

    /// Executes a query against the origin database.
    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Value, CacheError>;
}

/// Periodically pre-populates the caches from the origin.
pub struct CacheWarmer {
    config: WarmerConfig,
    sessions: Arc<SessionCache>,
    rbac: Arc<RbacCache>,
    queries: Arc<QueryResultCache>,
    origin: Arc<dyn OriginSource>,
    last_success: Mutex<Option<Instant>>,
}

impl CacheWarmer {
    pub fn new(
        config: WarmerConfig,
        sessions: Arc<SessionCache>,
        rbac: Arc<RbacCache>,
        queries: Arc<QueryResultCache>,
        origin: Arc<dyn OriginSource>,
    ) -> Self {
        Self {
            config,
            sessions,
            rbac,
            queries,
            origin,
            last_success: Mutex::new(None),
        }
    }

    /// Runs the warm-up loop: once at startup (if configured), then on the
    /// configured cadence, each cycle bounded by a hard deadline.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!("cache warmer disabled");
            return;
        }
        info!(
            interval = ?self.config.interval,
            concurrency = self.config.concurrency,
            "cache warmer started"
        );

        if self.config.warm_on_startup {
            self.warm_with_deadline().await;
        }

        // Stagger the periodic cadence so peer processes do not all hit the
        // origin at the same instant.
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..30));
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.config.interval + jitter,
            self.config.interval,
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.warm_with_deadline().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("cache warmer shutting down");
                    return;
                }
            }
        }
    }

    async fn warm_with_deadline(&self) {
        match tokio::time::timeout(self.config.timeout, self.warm_cycle()).await {
            Ok(warmed) => {
                *self.last_success.lock() = Some(Instant::now());
                info!(warmed, "warm-up cycle complete");
            }
            Err(_) => warn!(deadline = ?self.config.timeout, "warm-up cycle hit its deadline"),
        }
    }

    /// One full warm-up pass over all enabled categories. Returns how many
    /// entries were written.
    pub async fn warm_cycle(&self) -> usize {
        let (users, roles, queries) = tokio::join!(
            self.warm_users(),
            self.warm_role_permissions(),
            self.warm_frequent_queries(),
        );
        users + roles + queries
    }

    /// Pre-populates sessions for the configured active users.
    async fn warm_users(&self) -> usize {
        let ttl = self.config.ttl;
        let origin = Arc::clone(&self.origin);
        let sessions = Arc::clone(&self.sessions);
        let warmed = stream::iter(self.config.user_ids.iter().copied())
            .map(|user_id| {
                let origin = Arc::clone(&origin);
                let sessions = Arc::clone(&sessions);
                async move {
                    let Some(profile) = origin.fetch_user_profile(user_id).await else {
                        debug!(user_id, "no profile to warm");
                        return false;
                    };
                    match sessions
                        .cache()
                        .set_with_ttl(&keys::session_key(user_id), &profile, ttl, ttl)
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(user_id, "session warm-up failed: {e}");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        warmed
    }

    /// Synthesizes and caches the baseline role permission sets.
    async fn warm_role_permissions(&self) -> usize {
        self.rbac.preload_roles(&self.config.roles).await;
        self.config.roles.len()
    }

    /// Executes and caches the configured frequent queries.
    async fn warm_frequent_queries(&self) -> usize {
        let ttl = self.config.ttl;
        let origin = Arc::clone(&self.origin);
        let queries = Arc::clone(&self.queries);
        stream::iter(self.config.frequent_queries.iter().cloned())
            .map(|frequent| {
                let origin = Arc::clone(&origin);
                let queries = Arc::clone(&queries);
                async move {
                    let outcome = queries
                        .warm_query(
                            &frequent.sql,
                            &frequent.params,
                            move |sql, params| async move {
                                origin.execute_query(&sql, &params).await
                            },
                            ttl,
                        )
                        .await;
                    match outcome {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(sql = %frequent.sql, "query warm-up failed: {e}");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await
    }

    /// Healthy when the last successful cycle is no older than twice the
    /// warm-up interval.
    pub fn is_healthy(&self) -> bool {
        self.last_success
            .lock()
            .is_some_and(|at| at.elapsed() <= self.config.interval * 2)
    }
}
