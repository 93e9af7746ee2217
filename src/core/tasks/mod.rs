// src/core/tasks/mod.rs

//! Long-running background tasks that maintain the caches: TTL sweeping,
//! hot-query analysis, warm-up, and metrics aggregation.

pub mod aggregator;
pub mod hot_queries;
pub mod sweeper;
pub mod warmer;
