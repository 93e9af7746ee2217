// src/core/tasks/hot_queries.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::core::query::QueryResultCache;

/// How often the hot-query ranking is refreshed.
const ANALYSIS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodically re-ranks cached queries by access count so the hottest
/// ones are promoted into the local working set on their next T2 hit.
pub struct HotQueryAnalyzer {
    queries: Arc<QueryResultCache>,
}

impl HotQueryAnalyzer {
    pub fn new(queries: Arc<QueryResultCache>) -> Self {
        Self { queries }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("hot query analyzer started");
        let mut interval = tokio::time::interval(ANALYSIS_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.queries.analyze_hot_queries();
                }
                _ = shutdown_rx.recv() => {
                    info!("hot query analyzer shutting down");
                    return;
                }
            }
        }
    }
}
