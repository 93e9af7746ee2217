// src/core/invalidation/events.rs

//! Semantic invalidation events and their wire form.
//!
//! Events are produced locally by domain code and re-broadcast to peer
//! processes as JSON on `cache_invalidation:{type}` channels. Subscribers
//! re-apply received events idempotently and never re-publish them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Channel prefix for peer re-broadcast.
pub const CHANNEL_PREFIX: &str = "cache_invalidation:";

/// The semantic class of an invalidation event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventType {
    User,
    Role,
    Permission,
    Session,
    Query,
    Table,
    Pattern,
    Global,
}

impl EventType {
    /// The pub/sub channel carrying events of this type.
    pub fn channel(&self) -> String {
        format!("{CHANNEL_PREFIX}{self}")
    }
}

/// Processing priority. Critical events bypass batching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// The identity an event is about, tagged by what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ResourceId {
    User(u64),
    Role(String),
    Table(String),
    Pattern(String),
}

/// A single invalidation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub resource: String,
    pub resource_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub priority: Priority,
}

impl InvalidationEvent {
    pub fn new(event_type: EventType, resource_id: ResourceId) -> Self {
        let user_id = match &resource_id {
            ResourceId::User(u) => Some(*u),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            event_type,
            resource: String::new(),
            resource_id,
            user_id,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            source: "local".to_string(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// The pub/sub channel this event is re-broadcast on.
    pub fn channel(&self) -> String {
        self.event_type.channel()
    }
}
