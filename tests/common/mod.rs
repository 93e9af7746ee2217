// tests/common/mod.rs

//! Shared fixtures for the integration tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use stratacache::config::Config;
use stratacache::core::errors::CacheError;
use stratacache::core::rbac::RoleProvider;
use stratacache::core::tasks::warmer::OriginSource;
use stratacache::core::tier2::MemoryTier2;
use stratacache::CacheSystem;

/// Initializes test logging from `RUST_LOG`. Repeat calls are no-ops, so
/// every fixture can call it unconditionally.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Role provider backed by a fixed map, defaulting to `user`.
pub struct StaticRoles {
    pub assignments: HashMap<u64, String>,
}

impl StaticRoles {
    pub fn new(assignments: &[(u64, &str)]) -> Arc<Self> {
        Arc::new(Self {
            assignments: assignments
                .iter()
                .map(|(u, r)| (*u, r.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl RoleProvider for StaticRoles {
    async fn role_for(&self, user_id: u64) -> Option<String> {
        Some(
            self.assignments
                .get(&user_id)
                .cloned()
                .unwrap_or_else(|| "user".to_string()),
        )
    }
}

/// Origin that serves synthetic profiles and counts query executions.
#[derive(Default)]
pub struct StaticOrigin {
    pub executed: AtomicU64,
}

impl StaticOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn execution_count(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginSource for StaticOrigin {
    async fn fetch_user_profile(&self, user_id: u64) -> Option<Value> {
        Some(json!({"id": user_id, "name": format!("user-{user_id}")}))
    }

    async fn execute_query(&self, sql: &str, _params: &[Value]) -> Result<Value, CacheError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"rows": [], "query": sql}))
    }
}

/// Builds a full system over a fresh in-memory tier-2 store, with the
/// warmer disabled so tests control what is populated.
pub async fn build_system(t2: Arc<MemoryTier2>) -> CacheSystem {
    init_tracing();
    let mut config = Config::default();
    config.warmer.enabled = false;
    CacheSystem::new(
        config,
        t2,
        StaticRoles::new(&[]),
        StaticOrigin::new(),
    )
    .await
    .expect("system construction")
}
