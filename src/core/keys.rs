// src/core/keys.rs

//! Composes and inspects the key grammar shared by both tiers.
//!
//! Sessions:  `user_session:{u}`
//! RBAC:      `perm:{u}:{resource}:{action}`, `user_role:{u}`, `role_perm:{role}`
//! Queries:   `query:{hex32}` (128-bit digest)

pub const SESSION_PREFIX: &str = "user_session:";
pub const PERM_PREFIX: &str = "perm:";
pub const USER_ROLE_PREFIX: &str = "user_role:";
pub const ROLE_PERM_PREFIX: &str = "role_perm:";
pub const QUERY_PREFIX: &str = "query:";

/// Key for a cached user session.
pub fn session_key(user_id: u64) -> String {
    format!("{SESSION_PREFIX}{user_id}")
}

/// Key for a cached permission decision.
pub fn perm_key(user_id: u64, resource: &str, action: &str) -> String {
    format!("{PERM_PREFIX}{user_id}:{resource}:{action}")
}

/// Glob matching every permission decision cached for a user.
pub fn perm_pattern_for_user(user_id: u64) -> String {
    format!("{PERM_PREFIX}{user_id}:*")
}

/// Key for a cached user-to-role assignment.
pub fn user_role_key(user_id: u64) -> String {
    format!("{USER_ROLE_PREFIX}{user_id}")
}

/// Key for a cached role-to-permissions map.
pub fn role_perm_key(role: &str) -> String {
    format!("{ROLE_PERM_PREFIX}{role}")
}

/// Key for a memoized query result, from the hex-encoded 128-bit digest.
pub fn query_key(digest_hex: &str) -> String {
    format!("{QUERY_PREFIX}{digest_hex}")
}
