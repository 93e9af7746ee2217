// tests/unit_multi_level_test.rs

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::advance;

use stratacache::config::CacheProfile;
use stratacache::core::multi_level::MultiLevelCache;
use stratacache::core::session::SessionCache;
use stratacache::core::tier1::CacheTier;
use stratacache::core::tier2::{MemoryTier2, Tier2Store};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
}

fn ada() -> Profile {
    Profile {
        id: 42,
        name: "Ada".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn session_round_trip_survives_t2_outage() {
    let t2 = Arc::new(MemoryTier2::new());
    let sessions = SessionCache::new(CacheProfile::session(), t2.clone());

    sessions.set_user_session(42, &ada()).await.unwrap();
    advance(Duration::from_secs(1)).await;

    let (profile, tier) = sessions.get_user_session::<Profile>(42).await.unwrap();
    assert_eq!(profile, ada());
    assert_eq!(tier, CacheTier::L1);

    // The local tier keeps serving while the distributed store is down.
    t2.set_online(false);
    let (profile, tier) = sessions.get_user_session::<Profile>(42).await.unwrap();
    assert_eq!(profile, ada());
    assert_eq!(tier, CacheTier::L1);
}

#[tokio::test(start_paused = true)]
async fn read_promotes_from_t2_after_local_expiry() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    cache.set("user_session:7", &json!({"id": 7})).await.unwrap();

    // Past the T1 TTL but within the T2 TTL.
    advance(Duration::from_secs(6 * 60)).await;
    let (value, tier) = cache
        .get_with_tier::<serde_json::Value>("user_session:7")
        .await
        .unwrap();
    assert_eq!(value, json!({"id": 7}));
    assert_eq!(tier, CacheTier::L2);

    // The hit wrote through to T1.
    let (_, tier) = cache
        .get_with_tier::<serde_json::Value>("user_session:7")
        .await
        .unwrap();
    assert_eq!(tier, CacheTier::L1);
}

#[tokio::test(start_paused = true)]
async fn ttl_expires_in_both_tiers() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    cache.set("user_session:9", &json!({"id": 9})).await.unwrap();
    advance(Duration::from_secs(31 * 60)).await;
    assert!(cache.get::<serde_json::Value>("user_session:9").await.is_none());
    assert_eq!(t2.get("user_session:9").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn write_succeeds_with_t2_down() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    t2.set_online(false);
    cache.set("user_session:1", &json!({"id": 1})).await.unwrap();

    // Write-through: the same process reads its own write regardless of T2.
    let (value, tier) = cache
        .get_with_tier::<serde_json::Value>("user_session:1")
        .await
        .unwrap();
    assert_eq!(value, json!({"id": 1}));
    assert_eq!(tier, CacheTier::L1);
}

#[tokio::test(start_paused = true)]
async fn invalidate_removes_both_tiers() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    cache.set("user_session:5", &json!({"id": 5})).await.unwrap();
    cache.invalidate("user_session:5").await.unwrap();

    assert!(cache.get::<serde_json::Value>("user_session:5").await.is_none());
    assert_eq!(t2.get("user_session:5").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn pattern_invalidation_covers_matching_keys() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    for id in [1u64, 2, 3] {
        cache
            .set(&format!("user_session:{id}"), &json!({"id": id}))
            .await
            .unwrap();
    }
    let removed = cache.invalidate_pattern("user_session:*").await.unwrap();
    assert!(removed >= 3);
    for id in [1u64, 2, 3] {
        assert!(
            cache
                .get::<serde_json::Value>(&format!("user_session:{id}"))
                .await
                .is_none()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn undecodable_t2_payload_is_a_miss() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    t2.set(
        "user_session:8",
        bytes::Bytes::from_static(b"not json"),
        Some(Duration::from_secs(60)),
    )
    .await
    .unwrap();

    assert!(cache.get::<Profile>("user_session:8").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn read_counters_are_recorded() {
    let t2 = Arc::new(MemoryTier2::new());
    let cache = MultiLevelCache::new("session", CacheProfile::session(), t2.clone());

    cache.set("user_session:1", &json!({"id": 1})).await.unwrap();
    cache.get::<serde_json::Value>("user_session:1").await;
    cache.get::<serde_json::Value>("user_session:404").await;

    let snap = cache.stats().snapshot();
    assert_eq!(snap.writes, 1);
    assert_eq!(snap.reads, 2);
    assert_eq!(snap.l1_hits, 1);
    assert_eq!(snap.misses, 1);
}
