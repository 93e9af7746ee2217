// tests/integration_test.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StaticOrigin, StaticRoles};
use serde_json::{Value, json};

use stratacache::CacheSystem;
use stratacache::config::Config;
use stratacache::core::invalidation::{EventType, InvalidationEvent, Priority, ResourceId};
use stratacache::core::tier2::{MemoryTier2, Tier2Store};

#[tokio::test(start_paused = true)]
async fn startup_warm_up_populates_tier2() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = CacheSystem::new(
        Config::default(),
        t2.clone(),
        StaticRoles::new(&[(1, "admin")]),
        StaticOrigin::new(),
    )
    .await
    .unwrap();

    system.start();
    tokio::time::sleep(Duration::from_secs(5)).await;

    for user_id in 1..=5u64 {
        assert!(
            t2.get(&format!("user_session:{user_id}"))
                .await
                .unwrap()
                .is_some()
        );
    }
    for role in ["user", "moderator", "admin", "super"] {
        assert!(t2.get(&format!("role_perm:{role}")).await.unwrap().is_some());
    }
    assert_eq!(t2.keys("query:*").await.unwrap().len(), 3);

    system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_lifecycle_across_all_caches() {
    let t2 = Arc::new(MemoryTier2::new());
    let mut config = Config::default();
    config.warmer.enabled = false;
    let system = CacheSystem::new(
        config,
        t2.clone(),
        StaticRoles::new(&[(7, "moderator")]),
        StaticOrigin::new(),
    )
    .await
    .unwrap();
    system.start();

    // Sessions.
    system
        .sessions()
        .set_user_session(7, &json!({"id": 7, "name": "Mod"}))
        .await
        .unwrap();
    assert!(system.sessions().get_user_session::<Value>(7).await.is_some());

    // RBAC, derived from the moderator baseline.
    assert!(system.rbac().check(7, "chat", "moderate").await.allowed);
    assert!(!system.rbac().check(7, "users", "ban").await.allowed);

    // Queries.
    let outcome = system
        .queries()
        .execute_with_cache(
            "SELECT * FROM rooms WHERE id=$1",
            &[Value::from(1)],
            |_sql, _params| async { Ok(json!([{"id": 1}])) },
        )
        .await
        .unwrap();
    assert!(!outcome.from_cache);

    // A user event sweeps all three workloads; delivery runs through the
    // batching loop.
    system
        .invalidation()
        .submit(
            InvalidationEvent::new(EventType::User, ResourceId::User(7))
                .with_priority(Priority::High),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(system.sessions().get_user_session::<Value>(7).await.is_none());
    assert!(t2.keys("perm:7:*").await.unwrap().is_empty());

    // Operator surfaces.
    system.aggregator().collect_cycle().await;
    let report = system.aggregator().latest_report().unwrap();
    assert!(report.health_score > 0.0);

    system.shutdown().await;
}
