// src/core/system.rs

//! Wires the caches, the invalidation pipeline, and the background tasks
//! into one owned assembly with an explicit shutdown path.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use strum::IntoEnumIterator;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::errors::CacheError;
use crate::core::invalidation::{
    EventType, InvalidationManager, PeerSubscriber, QuerySink, RbacSink, SessionSink, Sinks,
};
use crate::core::query::QueryResultCache;
use crate::core::rbac::{RbacCache, RoleProvider};
use crate::core::session::SessionCache;
use crate::core::tasks::aggregator::MetricsAggregator;
use crate::core::tasks::hot_queries::HotQueryAnalyzer;
use crate::core::tasks::sweeper::SweeperTask;
use crate::core::tasks::warmer::{CacheWarmer, OriginSource};
use crate::core::tier1::LocalTier;
use crate::core::tier2::Tier2Store;

/// The assembled caching subsystem.
///
/// Owns the shared tier-2 handle, the three caches, the invalidation
/// manager, and every background task. Tasks are started by [`start`]
/// and stopped by [`shutdown`], which drains the event channel and takes
/// a final metrics snapshot before returning.
///
/// [`start`]: CacheSystem::start
/// [`shutdown`]: CacheSystem::shutdown
pub struct CacheSystem {
    config: Config,
    t2: Arc<dyn Tier2Store>,
    sessions: Arc<SessionCache>,
    rbac: Arc<RbacCache>,
    queries: Arc<QueryResultCache>,
    invalidation: Arc<InvalidationManager>,
    warmer: Arc<CacheWarmer>,
    aggregator: Arc<MetricsAggregator>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    event_loop: Mutex<Option<crate::core::invalidation::EventLoop>>,
}

impl CacheSystem {
    /// Builds the subsystem. Fails fast on an invalid configuration and
    /// preloads the baseline role permission sets.
    pub async fn new(
        config: Config,
        t2: Arc<dyn Tier2Store>,
        roles: Arc<dyn RoleProvider>,
        origin: Arc<dyn OriginSource>,
    ) -> Result<Self> {
        config.validate().context("invalid cache configuration")?;

        let sessions = Arc::new(SessionCache::new(config.profiles.session, Arc::clone(&t2)));
        let rbac = Arc::new(RbacCache::new(
            config.profiles.rbac,
            Arc::clone(&t2),
            roles,
        ));
        let queries = Arc::new(QueryResultCache::new(
            config.profiles.query,
            config.profiles.query_working_set,
            Arc::clone(&t2),
        ));

        rbac.preload_roles(&config.warmer.roles).await;

        let sinks = Sinks {
            session: Arc::new(SessionSink(Arc::clone(&sessions))),
            rbac: Arc::new(RbacSink(Arc::clone(&rbac))),
            query: Arc::new(QuerySink(Arc::clone(&queries))),
        };
        let (invalidation, event_loop) =
            InvalidationManager::new(config.invalidation.clone(), sinks, Arc::clone(&t2));

        let warmer = Arc::new(CacheWarmer::new(
            config.warmer.clone(),
            Arc::clone(&sessions),
            Arc::clone(&rbac),
            Arc::clone(&queries),
            origin,
        ));

        let aggregator = Arc::new(MetricsAggregator::new(
            config.metrics.clone(),
            config.alerts.clone(),
            sessions.cache().stats(),
            rbac.stats(),
            queries.stats(),
            Self::local_tiers(&sessions, &rbac, &queries),
            Arc::clone(&queries),
            Arc::clone(&invalidation),
            Arc::clone(&t2),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            t2,
            sessions,
            rbac,
            queries,
            invalidation,
            warmer,
            aggregator,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    fn local_tiers(
        sessions: &Arc<SessionCache>,
        rbac: &Arc<RbacCache>,
        queries: &Arc<QueryResultCache>,
    ) -> Vec<Arc<dyn LocalTier>> {
        vec![
            sessions.cache().tier1(),
            rbac.decision_store(),
            rbac.role_perm_store(),
            queries.working_set_store(),
        ]
    }

    /// Spawns every background task: the invalidation event loop, one peer
    /// subscriber per event channel, the TTL sweeper, the hot-query
    /// analyzer, the warmer, and the metrics aggregator.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("cache system already started");
            return;
        }

        let event_loop = self
            .event_loop
            .lock()
            .take()
            .expect("event loop consumed before start");
        tasks.push(tokio::spawn(event_loop.run(self.shutdown_tx.subscribe())));

        for event_type in EventType::iter() {
            let subscriber = PeerSubscriber::new(Arc::clone(&self.invalidation), event_type);
            tasks.push(tokio::spawn(subscriber.run(self.shutdown_tx.subscribe())));
        }

        let sweeper = SweeperTask::new(Self::local_tiers(
            &self.sessions,
            &self.rbac,
            &self.queries,
        ));
        tasks.push(tokio::spawn(sweeper.run(self.shutdown_tx.subscribe())));

        let analyzer = HotQueryAnalyzer::new(Arc::clone(&self.queries));
        tasks.push(tokio::spawn(analyzer.run(self.shutdown_tx.subscribe())));

        tasks.push(tokio::spawn(
            Arc::clone(&self.warmer).run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.aggregator).run(self.shutdown_tx.subscribe()),
        ));

        info!(tasks = tasks.len(), "cache system started");
    }

    /// Signals every task to stop and waits for them to finish. The event
    /// loop drains its channel and the aggregator flushes a final snapshot
    /// before exiting.
    pub async fn shutdown(&self) {
        info!("cache system shutting down");
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background task ended abnormally: {e}");
            }
        }
        info!("cache system stopped");
    }

    /// Operator-facing health probe: tier-2 reachability, warm-up age, and
    /// a synthetic event through the invalidation pipeline.
    pub async fn health_check(&self) -> Result<(), CacheError> {
        self.invalidation.health_check().await?;
        if self.config.warmer.enabled && !self.warmer.is_healthy() {
            return Err(CacheError::Internal(
                "last successful warm-up is too old".to_string(),
            ));
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tier2(&self) -> Arc<dyn Tier2Store> {
        Arc::clone(&self.t2)
    }

    pub fn sessions(&self) -> Arc<SessionCache> {
        Arc::clone(&self.sessions)
    }

    pub fn rbac(&self) -> Arc<RbacCache> {
        Arc::clone(&self.rbac)
    }

    pub fn queries(&self) -> Arc<QueryResultCache> {
        Arc::clone(&self.queries)
    }

    pub fn invalidation(&self) -> Arc<InvalidationManager> {
        Arc::clone(&self.invalidation)
    }

    pub fn warmer(&self) -> Arc<CacheWarmer> {
        Arc::clone(&self.warmer)
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }
}
