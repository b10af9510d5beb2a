//! Window store trait for abstracting the distributed and in-memory backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::key::WindowKey;
use crate::error::StoreError;

mod distributed;
mod failover;
mod memory;

pub use distributed::{RedisStoreConfig, RedisWindowStore};
pub use failover::FailoverStore;
pub use memory::{MemoryWindowStore, SweepHandle};

#[cfg(test)]
pub(crate) use failover::tests::UnreachableStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Which kind of backend a store is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared Redis instance
    Redis,
    /// Process-local map
    Memory,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Redis => f.write_str("redis"),
            Backend::Memory => f.write_str("memory"),
        }
    }
}

/// Counter state returned by [`WindowStore::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

/// Storage for fixed-window counters, block timestamps and whitelist entries.
///
/// Implementations must make `increment` atomic per key. Block and
/// whitelist entries expire on their own, independently of the counter.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// The kind of backend actually answering.
    fn backend(&self) -> Backend;

    /// Count one request, starting a fresh window of `window` if none is live.
    async fn increment(&self, key: &WindowKey, window: Duration) -> StoreResult<WindowCount>;

    /// The live block for a key, if any.
    async fn get_block(&self, key: &WindowKey) -> StoreResult<Option<DateTime<Utc>>>;

    /// Deny the key until `until`.
    async fn set_block(&self, key: &WindowKey, until: DateTime<Utc>) -> StoreResult<()>;

    /// Clear both the counter and the block for a key.
    async fn reset(&self, key: &WindowKey) -> StoreResult<()>;

    /// The live whitelist expiry for a client identifier, if any.
    async fn whitelisted_until(&self, identifier: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Whitelist a client identifier until `until`.
    async fn set_whitelist(&self, identifier: &str, until: DateTime<Utc>) -> StoreResult<()>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;

    /// Number of entries held locally, when the backend can tell cheaply.
    fn entry_count(&self) -> Option<usize> {
        None
    }
}
