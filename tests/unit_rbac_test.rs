// tests/unit_rbac_test.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::StaticRoles;
use tokio::time::advance;

use stratacache::config::CacheProfile;
use stratacache::core::keys;
use stratacache::core::rbac::{DefaultRoleProvider, RbacCache};
use stratacache::core::tier1::CacheTier;
use stratacache::core::tier2::{MemoryTier2, Tier2Store};

fn rbac_over(t2: Arc<MemoryTier2>, roles: &[(u64, &str)]) -> RbacCache {
    RbacCache::new(CacheProfile::rbac(), t2, StaticRoles::new(roles))
}

#[tokio::test(start_paused = true)]
async fn derivation_then_local_promotion() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2.clone(), &[(7, "user")]);

    let outcome = rbac.check(7, "chat", "write").await;
    assert!(outcome.allowed);
    assert!(!outcome.from_cache);
    assert_eq!(outcome.tier, CacheTier::Origin);

    // The derived decision is immediately available locally.
    let outcome = rbac.check(7, "chat", "write").await;
    assert!(outcome.allowed);
    assert!(outcome.from_cache);
    assert_eq!(outcome.tier, CacheTier::L1);
}

#[tokio::test(start_paused = true)]
async fn baseline_user_rules_apply() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2, &[(7, "user")]);

    assert!(rbac.check(7, "chat", "read").await.allowed);
    assert!(rbac.check(7, "chat", "write").await.allowed);
    assert!(!rbac.check(7, "chat", "moderate").await.allowed);
    assert!(!rbac.check(7, "admin_panel", "read").await.allowed);
}

#[tokio::test(start_paused = true)]
async fn admin_is_always_allowed() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2, &[(1, "admin")]);

    assert!(rbac.check(1, "anything", "purge").await.allowed);
    assert!(rbac.check(1, "chat", "read").await.allowed);
}

#[tokio::test(start_paused = true)]
async fn unknown_user_gets_default_role() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = RbacCache::new(CacheProfile::rbac(), t2.clone(), Arc::new(DefaultRoleProvider));

    assert!(rbac.check(99, "chat", "read").await.allowed);
    // The resolved role was cached for the next derivation.
    assert!(t2.get(&keys::user_role_key(99)).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn decision_promotes_from_t2_in_a_fresh_process() {
    let t2 = Arc::new(MemoryTier2::new());
    let first = rbac_over(t2.clone(), &[(7, "user")]);
    let outcome = first.check(7, "chat", "write").await;
    assert_eq!(outcome.tier, CacheTier::Origin);
    // Let the asynchronous write-back reach T2.
    tokio::task::yield_now().await;
    advance(Duration::from_millis(10)).await;

    // A second process sharing T2 serves the decision from L2.
    let second = rbac_over(t2, &[(7, "user")]);
    let outcome = second.check(7, "chat", "write").await;
    assert!(outcome.from_cache);
    assert_eq!(outcome.tier, CacheTier::L2);
}

#[tokio::test(start_paused = true)]
async fn invalidate_user_clears_decisions_and_role() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2.clone(), &[(7, "user")]);

    rbac.check(7, "chat", "read").await;
    rbac.check(7, "chat", "write").await;
    tokio::task::yield_now().await;
    advance(Duration::from_millis(10)).await;

    rbac.invalidate_user(7).await.unwrap();

    assert!(t2.keys("perm:7:*").await.unwrap().is_empty());
    assert_eq!(t2.get(&keys::user_role_key(7)).await.unwrap(), None);
    // Next check derives again rather than serving a stale decision.
    let outcome = rbac.check(7, "chat", "read").await;
    assert_eq!(outcome.tier, CacheTier::Origin);
}

#[tokio::test(start_paused = true)]
async fn invalidate_role_rederives_in_background() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2.clone(), &[(7, "user")]);

    rbac.check(7, "chat", "read").await;
    rbac.invalidate_role("user").await.unwrap();
    tokio::task::yield_now().await;
    advance(Duration::from_millis(10)).await;

    // The permission set was synthesized and written back eagerly.
    assert!(t2.get(&keys::role_perm_key("user")).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn preload_populates_baseline_roles() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2.clone(), &[]);
    let roles: Vec<String> = ["user", "moderator", "admin", "super"]
        .iter()
        .map(|r| r.to_string())
        .collect();

    rbac.preload_roles(&roles).await;
    for role in &roles {
        assert!(
            t2.get(&keys::role_perm_key(role)).await.unwrap().is_some(),
            "role_perm for {role} missing"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn derivation_survives_t2_outage() {
    let t2 = Arc::new(MemoryTier2::new());
    let rbac = rbac_over(t2.clone(), &[(7, "user")]);

    t2.set_online(false);
    let outcome = rbac.check(7, "chat", "read").await;
    assert!(outcome.allowed);
    assert_eq!(outcome.tier, CacheTier::Origin);

    // And the decision still landed in the local tier.
    let outcome = rbac.check(7, "chat", "read").await;
    assert_eq!(outcome.tier, CacheTier::L1);
}
