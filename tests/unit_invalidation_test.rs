// tests/unit_invalidation_test.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::build_system;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::time::advance;

use stratacache::core::errors::CacheError;
use stratacache::core::invalidation::{
    EventType, InvalidationEvent, PeerSubscriber, Priority, ResourceId,
};
use stratacache::core::tier1::CacheTier;
use stratacache::core::tier2::{MemoryTier2, Tier2Store};

async fn seed_user_nine(system: &stratacache::CacheSystem) {
    system
        .sessions()
        .set_user_session(9, &json!({"id": 9, "name": "Nine"}))
        .await
        .unwrap();
    system.rbac().check(9, "chat", "read").await;
    system
        .queries()
        .execute_with_cache(
            "SELECT * FROM users WHERE id=$1",
            &[Value::from(9)],
            |_sql, _params| async { Ok(json!([{"id": 9}])) },
        )
        .await
        .unwrap();
    // Let the asynchronous write-backs land in T2.
    tokio::task::yield_now().await;
    advance(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn user_event_fans_out_and_publishes() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;
    seed_user_nine(&system).await;

    assert!(t2.get("user_session:9").await.unwrap().is_some());
    assert!(!t2.keys("perm:9:*").await.unwrap().is_empty());
    assert_eq!(t2.keys("query:*").await.unwrap().len(), 1);

    let mut channel = t2.subscribe("cache_invalidation:user").await.unwrap();

    let event = InvalidationEvent::new(EventType::User, ResourceId::User(9))
        .with_priority(Priority::High);
    system
        .invalidation()
        .process_event(event, true)
        .await
        .unwrap();

    // All three caches lost their entries in both tiers.
    assert!(
        system
            .sessions()
            .get_user_session::<Value>(9)
            .await
            .is_none()
    );
    assert_eq!(t2.get("user_session:9").await.unwrap(), None);
    assert!(t2.keys("perm:9:*").await.unwrap().is_empty());
    assert!(t2.keys("query:*").await.unwrap().is_empty());
    let outcome = system.rbac().check(9, "chat", "read").await;
    assert_eq!(outcome.tier, CacheTier::Origin);

    // And the event went out as JSON on the type channel.
    let payload = channel.next().await.expect("published event");
    let wire: InvalidationEvent = serde_json::from_slice(&payload).unwrap();
    assert_eq!(wire.event_type, EventType::User);
    assert_eq!(wire.resource_id, ResourceId::User(9));
}

#[tokio::test(start_paused = true)]
async fn batched_events_flush_on_the_interval() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;
    system.start();
    seed_user_nine(&system).await;

    let event = InvalidationEvent::new(EventType::Session, ResourceId::User(9));
    system.invalidation().submit(event).await.unwrap();

    // Not processed yet: it sits in the batch buffer.
    let snapshot = system.invalidation().snapshot();
    assert_eq!(snapshot.received, 1);

    // The five-second flush interval processes it.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(t2.get("user_session:9").await.unwrap(), None);
    assert!(system.invalidation().snapshot().processed >= 1);

    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn critical_event_bypasses_the_batch() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;
    system.start();
    seed_user_nine(&system).await;

    // Fifty low-priority events accumulate without being processed.
    for id in 100..150u64 {
        let event = InvalidationEvent::new(EventType::Session, ResourceId::User(id))
            .with_priority(Priority::Low);
        system.invalidation().submit(event).await.unwrap();
    }

    // Seed an entry with a long remaining TTL to observe the clamp.
    let outcome = system
        .invalidation()
        .submit(
            InvalidationEvent::new(EventType::Session, ResourceId::User(9))
                .with_priority(Priority::Critical),
        )
        .await;
    assert!(outcome.is_ok());

    // The critical event already ran: the session is gone before any flush.
    assert_eq!(t2.get("user_session:9").await.unwrap(), None);
    let snapshot = system.invalidation().snapshot();
    assert_eq!(snapshot.by_priority.get(&Priority::Critical), Some(&1));
    assert!(snapshot.processed >= 1);

    // The blanket TTL override clamps the surviving local entries.
    system
        .sessions()
        .set_user_session(33, &json!({"id": 33}))
        .await
        .unwrap();
    system
        .invalidation()
        .submit(
            InvalidationEvent::new(EventType::Session, ResourceId::User(9))
                .with_priority(Priority::Critical),
        )
        .await
        .unwrap();
    advance(Duration::from_secs(61)).await;
    // T1 lost the entry once the clamped TTL elapsed; T2 still has it
    // within its own TTL, so the read reports the distributed tier.
    let (_, tier) = system
        .sessions()
        .get_user_session::<Value>(33)
        .await
        .unwrap();
    assert_eq!(tier, CacheTier::L2);

    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_flushes_when_full() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;
    system.start();

    for id in 0..100u64 {
        let event = InvalidationEvent::new(EventType::Session, ResourceId::User(id));
        system.invalidation().submit(event).await.unwrap();
    }
    // Size-triggered flush happens well before the five-second tick.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(system.invalidation().snapshot().processed >= 100);

    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn replaying_an_event_is_idempotent() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;
    seed_user_nine(&system).await;

    let event = InvalidationEvent::new(EventType::User, ResourceId::User(9));
    system
        .invalidation()
        .process_event(event.clone(), false)
        .await
        .unwrap();
    let mut after_first = t2.keys("*").await.unwrap();
    after_first.sort();

    system
        .invalidation()
        .process_event(event, false)
        .await
        .unwrap();
    let mut after_second = t2.keys("*").await.unwrap();
    after_second.sort();

    assert_eq!(after_first, after_second);
}

#[tokio::test(start_paused = true)]
async fn peer_applies_published_events() {
    let t2 = Arc::new(MemoryTier2::new());
    let publisher = build_system(t2.clone()).await;
    let peer = build_system(t2.clone()).await;

    // The peer listens on the session channel only.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let subscriber = PeerSubscriber::new(peer.invalidation(), EventType::Session);
    let handle = tokio::spawn(subscriber.run(shutdown_tx.subscribe()));
    tokio::task::yield_now().await;

    peer.sessions()
        .set_user_session(9, &json!({"id": 9}))
        .await
        .unwrap();

    let event = InvalidationEvent::new(EventType::Session, ResourceId::User(9));
    publisher
        .invalidation()
        .process_event(event, true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The peer dropped its local copy after replaying the event.
    assert!(peer.sessions().get_user_session::<Value>(9).await.is_none());

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test(start_paused = true)]
async fn partial_failure_is_aggregated() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;
    seed_user_nine(&system).await;

    // With T2 down, the pattern legs fail while TTL clamps still apply.
    t2.set_online(false);
    let event = InvalidationEvent::new(EventType::User, ResourceId::User(9));
    let err = system
        .invalidation()
        .process_event(event, true)
        .await
        .unwrap_err();
    match err {
        CacheError::PartialFailure { failed, total } => {
            assert!(failed > 0);
            assert!(failed <= total);
        }
        other => panic!("expected partial failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn health_check_publishes_through_the_pipeline() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2.clone()).await;

    let mut channel = t2.subscribe("cache_invalidation:pattern").await.unwrap();
    system.invalidation().health_check().await.unwrap();

    let payload = channel.next().await.expect("synthetic event");
    let wire: InvalidationEvent = serde_json::from_slice(&payload).unwrap();
    assert_eq!(wire.source, "health_check");
    assert_eq!(wire.priority, Priority::Low);
}
