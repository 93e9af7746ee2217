// src/core/tasks/sweeper.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::tier1::LocalTier;

/// The cadence at which local tiers are purged of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A task that periodically removes expired entries from every registered
/// local tier, so that keys never read again still release their memory.
pub struct SweeperTask {
    stores: Vec<Arc<dyn LocalTier>>,
}

impl SweeperTask {
    pub fn new(stores: Vec<Arc<dyn LocalTier>>) -> Self {
        Self { stores }
    }

    /// Runs the main loop for the sweeper.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(stores = self.stores.len(), "TTL sweeper started");
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_all();
                }
                _ = shutdown_rx.recv() => {
                    info!("TTL sweeper shutting down");
                    return;
                }
            }
        }
    }

    fn sweep_all(&self) {
        for store in &self.stores {
            let removed = store.sweep_expired();
            if removed > 0 {
                debug!(store = store.store_name(), removed, "sweep cycle complete");
            }
        }
    }
}
