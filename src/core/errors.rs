// src/core/errors.rs

//! Defines the primary error type for the caching subsystem.

use thiserror::Error;

/// The main error enum, representing all possible failures within the subsystem.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Tier-2 store unavailable: {0}")]
    Tier2Unavailable(String),

    #[error("Tier-2 operation timed out after {0} ms")]
    Tier2Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalidation rule targets unknown cache '{0}'")]
    UnknownTarget(String),

    #[error("Event channel is full")]
    ChannelFull,

    #[error("Event channel is closed")]
    ChannelClosed,

    #[error("{failed} of {total} invalidation rules failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Query executor error: {0}")]
    Executor(String),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// --- From trait implementations for easy error conversion ---

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Internal(e.to_string())
    }
}
