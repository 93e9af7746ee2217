// src/core/invalidation/rules.rs

//! Rule expansion: translating a semantic event into the cache-specific
//! deletions that realize it.

use std::time::Duration;

use crate::core::invalidation::events::{EventType, InvalidationEvent, Priority, ResourceId};
use crate::core::keys;

/// TTL forced onto surviving entries by a critical event.
const CRITICAL_TTL_OVERRIDE: Duration = Duration::from_secs(60);

/// Which cache a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTarget {
    Session,
    Rbac,
    Query,
    All,
}

/// How a rule selects keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    /// One exact key.
    Exact(String),
    /// A glob over key names.
    Glob(String),
    /// Queries whose stored SQL mentions a table. Query cache only.
    Table(String),
}

/// What a rule does to the selected keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Delete,
    /// Clamp remaining TTLs instead of deleting.
    Expire,
    /// Drop the entry so the next read re-derives it.
    Refresh,
    /// Marker only; carried in event metadata.
    Tag,
}

/// One cache-specific invalidation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRule {
    pub target: CacheTarget,
    pub pattern: KeyPattern,
    pub action: RuleAction,
    pub ttl_override: Option<Duration>,
}

impl InvalidationRule {
    fn delete(target: CacheTarget, pattern: KeyPattern) -> Self {
        Self {
            target,
            pattern,
            action: RuleAction::Delete,
            ttl_override: None,
        }
    }

    fn expire_all(ttl: Duration) -> Self {
        Self {
            target: CacheTarget::All,
            pattern: KeyPattern::Glob("*".to_string()),
            action: RuleAction::Expire,
            ttl_override: Some(ttl),
        }
    }
}

/// Expands an event into the rule set that realizes it.
///
/// Critical events additionally clamp every surviving entry to a one-minute
/// TTL, bounding staleness across all caches.
pub fn expand_rules(event: &InvalidationEvent) -> Vec<InvalidationRule> {
    use CacheTarget::*;
    use KeyPattern::*;

    let mut rules = match (&event.event_type, &event.resource_id) {
        (EventType::User, ResourceId::User(u)) => vec![
            InvalidationRule::delete(Session, Exact(keys::session_key(*u))),
            InvalidationRule::delete(Rbac, Glob(keys::perm_pattern_for_user(*u))),
            InvalidationRule::delete(Rbac, Exact(keys::user_role_key(*u))),
            InvalidationRule::delete(Query, Table("users".to_string())),
        ],
        (EventType::User, _) => vec![
            InvalidationRule::delete(Session, Glob(format!("{}*", keys::SESSION_PREFIX))),
            InvalidationRule::delete(Rbac, Glob(format!("{}*", keys::PERM_PREFIX))),
            InvalidationRule::delete(Query, Table("users".to_string())),
        ],
        (EventType::Role, ResourceId::Role(role)) => vec![
            InvalidationRule::delete(Rbac, Exact(keys::role_perm_key(role))),
            // Decisions derived from the old permission set are stale.
            InvalidationRule::delete(Rbac, Glob(format!("{}*", keys::PERM_PREFIX))),
        ],
        (EventType::Role, _) => vec![
            InvalidationRule::delete(Rbac, Glob(format!("{}*", keys::ROLE_PERM_PREFIX))),
            InvalidationRule::delete(Rbac, Glob(format!("{}*", keys::PERM_PREFIX))),
        ],
        (EventType::Permission, ResourceId::User(u)) => vec![InvalidationRule::delete(
            Rbac,
            Glob(keys::perm_pattern_for_user(*u)),
        )],
        (EventType::Permission, ResourceId::Role(role)) => vec![
            InvalidationRule::delete(Rbac, Exact(keys::role_perm_key(role))),
            InvalidationRule::delete(Rbac, Glob(format!("{}*", keys::PERM_PREFIX))),
        ],
        (EventType::Permission, _) => vec![InvalidationRule::delete(
            Rbac,
            Glob(format!("{}*", keys::PERM_PREFIX)),
        )],
        (EventType::Session, ResourceId::User(u)) => vec![InvalidationRule::delete(
            Session,
            Exact(keys::session_key(*u)),
        )],
        (EventType::Session, _) => vec![InvalidationRule::delete(
            Session,
            Glob(format!("{}*", keys::SESSION_PREFIX)),
        )],
        (EventType::Query, ResourceId::Pattern(glob)) => {
            vec![InvalidationRule::delete(Query, Glob(glob.clone()))]
        }
        (EventType::Query, ResourceId::Table(table)) => {
            vec![InvalidationRule::delete(Query, Table(table.clone()))]
        }
        (EventType::Query, _) => vec![InvalidationRule::delete(
            Query,
            Glob(format!("{}*", keys::QUERY_PREFIX)),
        )],
        (EventType::Table, ResourceId::Table(table)) => {
            vec![InvalidationRule::delete(Query, Table(table.clone()))]
        }
        (EventType::Table, _) => vec![InvalidationRule::delete(
            Query,
            Glob(format!("{}*", keys::QUERY_PREFIX)),
        )],
        (EventType::Pattern, ResourceId::Pattern(glob)) => {
            vec![InvalidationRule::delete(All, Glob(glob.clone()))]
        }
        (EventType::Pattern, _) => vec![],
        (EventType::Global, _) => vec![InvalidationRule::delete(All, Glob("*".to_string()))],
    };

    if event.priority == Priority::Critical {
        rules.push(InvalidationRule::expire_all(CRITICAL_TTL_OVERRIDE));
    }
    rules
}
