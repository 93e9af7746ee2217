// src/core/rbac.rs

//! Caches authorization decisions: user roles, role permission sets, and
//! derived (user, resource, action) verdicts, with aggressive promotion
//! into the local tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::config::CacheProfile;
use crate::core::errors::CacheError;
use crate::core::keys;
use crate::core::metrics;
use crate::core::stats::CacheStats;
use crate::core::tier1::{CacheTier, Tier1Store};
use crate::core::tier2::Tier2Store;

/// A permission decision older than this is re-derived even if still cached.
const PERMISSION_FRESHNESS: Duration = Duration::from_secs(5 * 60);
/// How long a user-to-role assignment stays cached in T2.
const USER_ROLE_TTL: Duration = Duration::from_secs(30 * 60);
/// How long a role permission set stays cached in T2.
const ROLE_PERM_TTL: Duration = Duration::from_secs(60 * 60);
/// Role permission sets reaching this many T2 hits are promoted to T1.
const ROLE_PERM_PROMOTION_HITS: u32 = 2;

const ADMIN_ROLE: &str = "admin";
const DEFAULT_ROLE: &str = "user";

/// Maps a resource to the actions a role may perform on it. The resource
/// `"*"` grants across all resources; the action `"*"` grants all actions.
pub type RolePermissions = HashMap<String, Vec<String>>;

/// The baseline role table, used to synthesize permission sets that are
/// missing from T2 and to preload the well-known roles.
static BASELINE_ROLES: Lazy<HashMap<&'static str, RolePermissions>> = Lazy::new(|| {
    fn set(entries: &[(&str, &[&str])]) -> RolePermissions {
        entries
            .iter()
            .map(|(resource, actions)| {
                (
                    resource.to_string(),
                    actions.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect()
    }

    HashMap::from([
        (
            "user",
            set(&[
                ("chat", &["read", "write"]),
                ("rooms", &["read", "join"]),
                ("files", &["read", "upload"]),
                ("profile", &["read", "write"]),
            ]),
        ),
        (
            "moderator",
            set(&[
                ("chat", &["read", "write", "delete", "moderate"]),
                ("rooms", &["read", "join", "manage"]),
                ("files", &["read", "upload", "delete"]),
                ("profile", &["read", "write"]),
                ("users", &["read", "mute"]),
            ]),
        ),
        ("admin", set(&[("*", &["*"])])),
        ("super", set(&[("*", &["*"])])),
    ])
});

/// A cached (user, resource, action) verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub role: String,
    pub checked_at: DateTime<Utc>,
    pub source_tier: CacheTier,
}

/// A cached user-to-role assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRoleEntry {
    pub role: String,
    pub expires_at: DateTime<Utc>,
}

/// The outcome handed to callers of [`RbacCache::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub allowed: bool,
    pub from_cache: bool,
    pub tier: CacheTier,
}

/// Resolves a user's role when it is not cached. Implemented by the user
/// service; the default falls back to the baseline role.
#[async_trait]
pub trait RoleProvider: Send + Sync {
    async fn role_for(&self, user_id: u64) -> Option<String>;
}

/// Assigns every unknown user the baseline role.
pub struct DefaultRoleProvider;

#[async_trait]
impl RoleProvider for DefaultRoleProvider {
    async fn role_for(&self, _user_id: u64) -> Option<String> {
        Some(DEFAULT_ROLE.to_string())
    }
}

/// The RBAC decision cache.
pub struct RbacCache {
    profile: CacheProfile,
    decisions: Arc<Tier1Store<PermissionDecision>>,
    role_perms: Arc<Tier1Store<RolePermissions>>,
    role_perm_hits: DashMap<String, u32>,
    t2: Arc<dyn Tier2Store>,
    roles: Arc<dyn RoleProvider>,
    stats: Arc<CacheStats>,
}

impl RbacCache {
    pub fn new(
        profile: CacheProfile,
        t2: Arc<dyn Tier2Store>,
        roles: Arc<dyn RoleProvider>,
    ) -> Self {
        Self {
            profile,
            decisions: Arc::new(Tier1Store::new("rbac", profile.max_items)),
            role_perms: Arc::new(Tier1Store::new("rbac_role_perm", BASELINE_ROLES.len() * 4)),
            role_perm_hits: DashMap::new(),
            t2,
            roles,
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Answers whether `user_id` may perform `action` on `resource`.
    ///
    /// Checks T1 for a fresh decision, falls back to T2 with promotion, and
    /// otherwise derives the verdict from the user's role and the role's
    /// permission set, writing the result back through both tiers.
    pub async fn check(&self, user_id: u64, resource: &str, action: &str) -> CheckOutcome {
        let started = Instant::now();
        let pk = keys::perm_key(user_id, resource, action);

        if let Some(decision) = self.decisions.get(&pk) {
            let age = Utc::now() - decision.checked_at;
            if age.to_std().is_ok_and(|age| age <= PERMISSION_FRESHNESS) {
                self.stats.record_l1_hit();
                self.stats.record_latency(started.elapsed());
                metrics::CACHE_HITS_TOTAL
                    .with_label_values(&["rbac", "l1"])
                    .inc();
                return CheckOutcome {
                    allowed: decision.allowed,
                    from_cache: true,
                    tier: CacheTier::L1,
                };
            }
        }

        match self.t2.get(&pk).await {
            Ok(Some(payload)) => {
                if let Ok(mut decision) = serde_json::from_slice::<PermissionDecision>(&payload) {
                    decision.source_tier = CacheTier::L2;
                    self.decisions
                        .put(pk.as_str(), decision.clone(), self.profile.t1_ttl, CacheTier::L2);
                    self.stats.record_l2_hit();
                    self.stats.record_latency(started.elapsed());
                    metrics::CACHE_HITS_TOTAL
                        .with_label_values(&["rbac", "l2"])
                        .inc();
                    return CheckOutcome {
                        allowed: decision.allowed,
                        from_cache: true,
                        tier: CacheTier::L2,
                    };
                }
                warn!(key = %pk, "discarding undecodable permission entry");
            }
            Ok(None) => {}
            Err(e) => {
                debug!(key = %pk, "T2 read failed, deriving from origin: {e}");
                self.stats.record_error();
            }
        }

        // Full miss: derive from role and role permissions.
        let role = self.lookup_user_role(user_id).await;
        let perms = self.lookup_role_permissions(&role).await;
        let allowed = evaluate_rules(&role, &perms, resource, action);

        let decision = PermissionDecision {
            allowed,
            role,
            checked_at: Utc::now(),
            source_tier: CacheTier::Origin,
        };
        self.decisions
            .put(pk.as_str(), decision.clone(), self.profile.t1_ttl, CacheTier::L1);
        self.write_back(pk, decision);

        self.stats.record_miss();
        self.stats.record_latency(started.elapsed());
        metrics::CACHE_MISSES_TOTAL.with_label_values(&["rbac"]).inc();
        CheckOutcome {
            allowed,
            from_cache: false,
            tier: CacheTier::Origin,
        }
    }

    /// Resolves the user's role from T2, falling back to the role provider.
    async fn lookup_user_role(&self, user_id: u64) -> String {
        let key = keys::user_role_key(user_id);
        match self.t2.get(&key).await {
            Ok(Some(payload)) => {
                if let Ok(entry) = serde_json::from_slice::<UserRoleEntry>(&payload) {
                    if entry.expires_at > Utc::now() {
                        return entry.role;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!(key = %key, "T2 role lookup failed: {e}"),
        }

        let role = self
            .roles
            .role_for(user_id)
            .await
            .unwrap_or_else(|| DEFAULT_ROLE.to_string());

        let entry = UserRoleEntry {
            role: role.clone(),
            expires_at: Utc::now() + USER_ROLE_TTL,
        };
        if let Ok(payload) = serde_json::to_vec(&entry) {
            if let Err(e) = self
                .t2
                .set(&key, Bytes::from(payload), Some(USER_ROLE_TTL))
                .await
            {
                debug!(key = %key, "caching user role failed: {e}");
            }
        }
        role
    }

    /// Resolves a role's permission set: T1, then T2 (promoting on the
    /// second hit), then the baseline table.
    async fn lookup_role_permissions(&self, role: &str) -> RolePermissions {
        let key = keys::role_perm_key(role);
        if let Some(perms) = self.role_perms.get(&key) {
            return perms;
        }

        match self.t2.get(&key).await {
            Ok(Some(payload)) => {
                if let Ok(perms) = serde_json::from_slice::<RolePermissions>(&payload) {
                    let mut hits = self.role_perm_hits.entry(key.clone()).or_insert(0);
                    *hits += 1;
                    if *hits >= ROLE_PERM_PROMOTION_HITS {
                        self.role_perms
                            .put(key.as_str(), perms.clone(), self.profile.t1_ttl, CacheTier::L2);
                    }
                    return perms;
                }
                warn!(key = %key, "discarding undecodable role permission entry");
            }
            Ok(None) => {}
            Err(e) => debug!(key = %key, "T2 role permission lookup failed: {e}"),
        }

        let perms = synthesize_role_permissions(role);
        if let Ok(payload) = serde_json::to_vec(&perms) {
            if let Err(e) = self
                .t2
                .set(&key, Bytes::from(payload), Some(ROLE_PERM_TTL))
                .await
            {
                debug!(key = %key, "caching role permissions failed: {e}");
            }
        }
        perms
    }

    /// Writes a derived decision to T2 off the request path.
    fn write_back(&self, key: String, decision: PermissionDecision) {
        let t2 = Arc::clone(&self.t2);
        let ttl = self.profile.t2_ttl;
        tokio::spawn(async move {
            match serde_json::to_vec(&decision) {
                Ok(payload) => {
                    if let Err(e) = t2.set(&key, Bytes::from(payload), Some(ttl)).await {
                        debug!(key = %key, "permission write-back failed: {e}");
                    }
                }
                Err(e) => warn!(key = %key, "permission decision did not serialize: {e}"),
            }
        });
    }

    /// Drops every cached decision for a user, plus their role assignment.
    pub async fn invalidate_user(&self, user_id: u64) -> Result<(), CacheError> {
        let pattern = keys::perm_pattern_for_user(user_id);
        let matcher = WildMatch::new(&pattern);
        self.decisions.delete_if(|k, _| matcher.matches(k));

        let mut doomed = self.t2.keys(&pattern).await?;
        doomed.push(keys::user_role_key(user_id));
        self.t2.del(&doomed).await?;
        Ok(())
    }

    /// Drops a role's permission set and eagerly re-derives it in the
    /// background from the baseline table.
    pub async fn invalidate_role(&self, role: &str) -> Result<(), CacheError> {
        let key = keys::role_perm_key(role);
        self.role_perms.delete(&key);
        self.role_perm_hits.remove(&key);
        self.t2.del(std::slice::from_ref(&key)).await?;

        let t2 = Arc::clone(&self.t2);
        let role = role.to_string();
        tokio::spawn(async move {
            let perms = synthesize_role_permissions(&role);
            if let Ok(payload) = serde_json::to_vec(&perms) {
                if let Err(e) = t2
                    .set(&keys::role_perm_key(&role), Bytes::from(payload), Some(ROLE_PERM_TTL))
                    .await
                {
                    debug!(role = %role, "role permission re-derivation failed: {e}");
                }
            }
        });
        Ok(())
    }

    /// Deletes every key matching a glob pattern from both tiers.
    pub async fn invalidate_matching(&self, pattern: &str) -> Result<(), CacheError> {
        let matcher = WildMatch::new(pattern);
        self.decisions.delete_if(|k, _| matcher.matches(k));
        self.role_perms.delete_if(|k, _| matcher.matches(k));

        let doomed = self.t2.keys(pattern).await?;
        if !doomed.is_empty() {
            self.t2.del(&doomed).await?;
        }
        Ok(())
    }

    /// Synthesizes and caches the permission sets of the baseline roles.
    pub async fn preload_roles(&self, roles: &[String]) {
        for role in roles {
            let perms = synthesize_role_permissions(role);
            let key = keys::role_perm_key(role);
            match serde_json::to_vec(&perms) {
                Ok(payload) => {
                    if let Err(e) = self
                        .t2
                        .set(&key, Bytes::from(payload), Some(ROLE_PERM_TTL))
                        .await
                    {
                        warn!(role = %role, "role preload failed: {e}");
                    }
                }
                Err(e) => warn!(role = %role, "role permissions did not serialize: {e}"),
            }
        }
        debug!(count = roles.len(), "baseline roles preloaded");
    }

    /// Caps the remaining TTL of every locally cached entry.
    pub fn expire_all(&self, max_ttl: Duration) {
        self.decisions.clamp_ttl(max_ttl);
        self.role_perms.clamp_ttl(max_ttl);
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn decision_store(&self) -> Arc<Tier1Store<PermissionDecision>> {
        Arc::clone(&self.decisions)
    }

    pub fn role_perm_store(&self) -> Arc<Tier1Store<RolePermissions>> {
        Arc::clone(&self.role_perms)
    }
}

/// Evaluates a role's permission set against a (resource, action) pair.
/// `"*"` in the resource or action position is a wildcard; the admin role
/// is always allowed.
fn evaluate_rules(role: &str, perms: &RolePermissions, resource: &str, action: &str) -> bool {
    if role == ADMIN_ROLE {
        return true;
    }
    if let Some(actions) = perms.get("*") {
        if actions.iter().any(|a| a == "*" || a == action) {
            return true;
        }
    }
    if let Some(actions) = perms.get(resource) {
        return actions.iter().any(|a| a == "*" || a == action);
    }
    false
}

/// Builds a role's permission set from the baseline table. Unknown roles
/// receive the baseline user's permissions.
fn synthesize_role_permissions(role: &str) -> RolePermissions {
    BASELINE_ROLES
        .get(role)
        .or_else(|| BASELINE_ROLES.get(DEFAULT_ROLE))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_rules() {
        let all: RolePermissions = HashMap::from([("*".to_string(), vec!["*".to_string()])]);
        assert!(evaluate_rules("super", &all, "anything", "delete"));

        let scoped: RolePermissions =
            HashMap::from([("chat".to_string(), vec!["*".to_string()])]);
        assert!(evaluate_rules("user", &scoped, "chat", "purge"));
        assert!(!evaluate_rules("user", &scoped, "files", "read"));

        let explicit: RolePermissions = HashMap::from([(
            "chat".to_string(),
            vec!["read".to_string(), "write".to_string()],
        )]);
        assert!(evaluate_rules("user", &explicit, "chat", "write"));
        assert!(!evaluate_rules("user", &explicit, "chat", "delete"));
    }

    #[test]
    fn admin_implies_allow() {
        let empty = RolePermissions::default();
        assert!(evaluate_rules("admin", &empty, "chat", "purge"));
        assert!(!evaluate_rules("user", &empty, "chat", "read"));
    }

    #[test]
    fn unknown_role_falls_back_to_baseline() {
        let perms = synthesize_role_permissions("guest");
        assert_eq!(perms, synthesize_role_permissions("user"));
    }
}
