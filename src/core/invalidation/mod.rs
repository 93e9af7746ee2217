// src/core/invalidation/mod.rs

//! The invalidation manager: ingests semantic events, expands them into
//! cache-specific rules, fans the rules out to the three caches, and
//! re-broadcasts each event to peer processes over the distributed tier.
//!
//! Non-critical events accumulate in a bounded channel and are flushed in
//! batches grouped by type; critical events bypass the channel entirely.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::InvalidationConfig;
use crate::core::errors::CacheError;
use crate::core::metrics;
use crate::core::tier2::Tier2Store;

pub mod events;
pub mod rules;
pub mod sinks;

pub use events::{EventType, InvalidationEvent, Priority, ResourceId};
pub use rules::{CacheTarget, InvalidationRule, KeyPattern, RuleAction, expand_rules};
pub use sinks::{InvalidationSink, QuerySink, RbacSink, SessionSink};

/// Fallback TTL clamp when an expire rule carries no override.
const DEFAULT_EXPIRE_TTL: Duration = Duration::from_secs(60);
/// Delay before retrying a failed peer channel subscription.
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The capability handles for the three caches, injected at construction.
pub struct Sinks {
    pub session: Arc<dyn InvalidationSink>,
    pub rbac: Arc<dyn InvalidationSink>,
    pub query: Arc<dyn InvalidationSink>,
}

impl Sinks {
    fn select(&self, target: CacheTarget) -> Vec<&Arc<dyn InvalidationSink>> {
        match target {
            CacheTarget::Session => vec![&self.session],
            CacheTarget::Rbac => vec![&self.rbac],
            CacheTarget::Query => vec![&self.query],
            CacheTarget::All => vec![&self.session, &self.rbac, &self.query],
        }
    }
}

/// Point-in-time counters for the event pipeline.
#[derive(Debug, Clone, Default)]
pub struct InvalidationSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub ema_latency_ms: f64,
    pub by_type: HashMap<EventType, u64>,
    pub by_priority: HashMap<Priority, u64>,
}

/// Accepts, batches, executes, and re-broadcasts invalidation events.
pub struct InvalidationManager {
    config: InvalidationConfig,
    sinks: Sinks,
    t2: Arc<dyn Tier2Store>,
    tx: mpsc::Sender<InvalidationEvent>,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    by_type: DashMap<EventType, u64>,
    by_priority: DashMap<Priority, u64>,
    ema_latency_ms: Mutex<Option<f64>>,
}

impl InvalidationManager {
    /// Builds the manager and the event loop that must be spawned to drain
    /// the channel.
    pub fn new(
        config: InvalidationConfig,
        sinks: Sinks,
        t2: Arc<dyn Tier2Store>,
    ) -> (Arc<Self>, EventLoop) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let manager = Arc::new(Self {
            config,
            sinks,
            t2,
            tx,
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            by_type: DashMap::new(),
            by_priority: DashMap::new(),
            ema_latency_ms: Mutex::new(None),
        });
        let event_loop = EventLoop {
            manager: Arc::clone(&manager),
            rx,
        };
        (manager, event_loop)
    }

    /// Submits an event for processing.
    ///
    /// Critical events are executed inline, ahead of anything batched.
    /// Others enter the bounded channel; when it is full, producers either
    /// block or drop with a warning, per configuration.
    pub async fn submit(&self, event: InvalidationEvent) -> Result<(), CacheError> {
        self.received.fetch_add(1, Ordering::Relaxed);
        *self.by_type.entry(event.event_type).or_insert(0) += 1;
        *self.by_priority.entry(event.priority).or_insert(0) += 1;

        if event.priority == Priority::Critical {
            return self.process_event(event, true).await;
        }

        if self.config.drop_when_full {
            match self.tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!(
                        event_type = %event.event_type,
                        "invalidation channel full, dropping event"
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::EVENTS_DROPPED_TOTAL.inc();
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(CacheError::ChannelClosed),
            }
        } else {
            self.tx
                .send(event)
                .await
                .map_err(|_| CacheError::ChannelClosed)
        }
    }

    /// Expands an event and executes its rules against the caches.
    ///
    /// Partial failures do not abort remaining rules; they are reported as
    /// one aggregate error after the publish leg runs. When `publish` is
    /// false (replaying a peer's event) nothing is re-broadcast.
    pub async fn process_event(
        &self,
        event: InvalidationEvent,
        publish: bool,
    ) -> Result<(), CacheError> {
        let started = Instant::now();
        let rules = expand_rules(&event);
        let total = rules.len();

        let results = join_all(rules.iter().map(|rule| self.apply_rule(rule))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();

        if publish {
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    if let Err(e) = self.t2.publish(&event.channel(), Bytes::from(payload)).await {
                        warn!(channel = %event.channel(), "peer publish failed: {e}");
                    }
                }
                Err(e) => warn!(event_id = %event.id, "event did not serialize: {e}"),
            }
        }

        metrics::INVALIDATIONS_TOTAL
            .with_label_values(&[&event.event_type.to_string()])
            .inc();
        self.record_latency(started.elapsed());

        if failed > 0 {
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                failed,
                total,
                "invalidation completed with failures"
            );
            Err(CacheError::PartialFailure { failed, total })
        } else {
            self.processed.fetch_add(1, Ordering::Relaxed);
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                rules = total,
                "invalidation complete"
            );
            Ok(())
        }
    }

    /// Executes one rule against its target caches in parallel.
    async fn apply_rule(&self, rule: &InvalidationRule) -> Result<(), CacheError> {
        let targets = self.sinks.select(rule.target);
        let results = join_all(targets.into_iter().map(|sink| async {
            match rule.action {
                RuleAction::Delete | RuleAction::Refresh => match &rule.pattern {
                    KeyPattern::Exact(key) => sink.invalidate_key(key).await,
                    KeyPattern::Glob(glob) => sink.invalidate_glob(glob).await,
                    KeyPattern::Table(table) => sink.invalidate_table(table).await,
                },
                RuleAction::Expire => {
                    sink.expire_all(rule.ttl_override.unwrap_or(DEFAULT_EXPIRE_TTL));
                    Ok(())
                }
                RuleAction::Tag => {
                    debug!(cache = sink.cache_name(), ?rule.pattern, "tag rule recorded");
                    Ok(())
                }
            }
        }))
        .await;

        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Pushes a synthetic event through the real pipeline, publish leg
    /// included, and probes the distributed tier.
    pub async fn health_check(&self) -> Result<(), CacheError> {
        self.t2.ping().await?;
        let event = InvalidationEvent::new(
            EventType::Pattern,
            ResourceId::Pattern("stratacache:healthcheck:*".to_string()),
        )
        .with_priority(Priority::Low)
        .with_source("health_check");
        self.process_event(event, true).await
    }

    fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000.0;
        let mut ema = self.ema_latency_ms.lock();
        *ema = Some(match *ema {
            Some(prev) => 0.2 * sample + 0.8 * prev,
            None => sample,
        });
    }

    pub fn snapshot(&self) -> InvalidationSnapshot {
        InvalidationSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ema_latency_ms: (*self.ema_latency_ms.lock()).unwrap_or(0.0),
            by_type: self.by_type.iter().map(|e| (*e.key(), *e.value())).collect(),
            by_priority: self
                .by_priority
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
        }
    }
}

/// Drains the event channel, batching non-critical events until the batch
/// size or flush interval is reached, then processing them grouped by type.
pub struct EventLoop {
    manager: Arc<InvalidationManager>,
    rx: mpsc::Receiver<InvalidationEvent>,
}

impl EventLoop {
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("invalidation event loop started");
        let flush_interval = self.manager.config.flush_interval;
        let batch_size = self.manager.config.batch_size;
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buffer: Vec<InvalidationEvent> = Vec::with_capacity(batch_size);

        loop {
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            buffer.push(event);
                            if buffer.len() >= batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => {
                            self.flush(&mut buffer).await;
                            info!("invalidation channel closed, event loop exiting");
                            return;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Drain whatever is still queued before exiting.
                    while let Ok(event) = self.rx.try_recv() {
                        buffer.push(event);
                    }
                    self.flush(&mut buffer).await;
                    info!("invalidation event loop shutting down");
                    return;
                }
            }
        }
    }

    /// Groups buffered events by type and processes the groups in parallel.
    async fn flush(&self, buffer: &mut Vec<InvalidationEvent>) {
        if buffer.is_empty() {
            return;
        }
        let mut groups: HashMap<EventType, Vec<InvalidationEvent>> = HashMap::new();
        for event in buffer.drain(..) {
            groups.entry(event.event_type).or_default().push(event);
        }
        debug!(groups = groups.len(), "flushing invalidation batch");

        let manager = &self.manager;
        join_all(groups.into_values().map(|events| async move {
            for event in events {
                // Failures are already counted and logged by process_event.
                let _ = manager.process_event(event, true).await;
            }
        }))
        .await;
    }
}

/// Listens on one peer channel and idempotently re-applies received events
/// without re-publishing them.
pub struct PeerSubscriber {
    manager: Arc<InvalidationManager>,
    event_type: EventType,
}

impl PeerSubscriber {
    pub fn new(manager: Arc<InvalidationManager>, event_type: EventType) -> Self {
        Self {
            manager,
            event_type,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let channel = self.event_type.channel();
        info!(channel = %channel, "peer invalidation subscriber started");
        loop {
            let mut stream = match self.manager.t2.subscribe(&channel).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(channel = %channel, "subscribe failed, retrying: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(SUBSCRIBE_RETRY_DELAY) => continue,
                        _ = shutdown_rx.recv() => return,
                    }
                }
            };

            loop {
                tokio::select! {
                    maybe_payload = stream.next() => {
                        match maybe_payload {
                            Some(payload) => self.apply_remote(&payload).await,
                            None => break, // Stream ended; resubscribe.
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(channel = %channel, "peer subscriber shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn apply_remote(&self, payload: &[u8]) {
        match serde_json::from_slice::<InvalidationEvent>(payload) {
            Ok(event) => {
                debug!(event_id = %event.id, channel = %event.channel(), "applying peer event");
                let _ = self.manager.process_event(event, false).await;
            }
            Err(e) => warn!(channel = %self.event_type.channel(), "undecodable peer event: {e}"),
        }
    }
}
