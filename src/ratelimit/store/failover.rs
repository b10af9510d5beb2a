//! Primary store with a per-call in-memory fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{Backend, MemoryWindowStore, StoreResult, WindowCount, WindowStore};
use crate::ratelimit::clock::offset;
use crate::ratelimit::key::WindowKey;

/// Routes every call to a primary store and, when that call fails, answers
/// it from a [`MemoryWindowStore`] instead.
///
/// Errors are never retried on the primary. A check makes up to four store
/// calls (whitelist, block, increment and, on a violation, set block), so
/// with no cooldown a check against a hung primary can wait four command
/// timeouts. After a failure the primary is skipped for
/// [`cooldown`](Self::with_cooldown), which bounds that to one timeout per
/// cooldown period across all callers. `ping` always goes to the primary
/// and reports its error, since it exists to test reachability.
pub struct FailoverStore {
    primary: Arc<dyn WindowStore>,
    fallback: MemoryWindowStore,
    fallbacks: AtomicU64,
    cooldown: Duration,
    suspended_until: Mutex<Option<DateTime<Utc>>>,
}

impl FailoverStore {
    /// Wrap `primary`, falling back to `fallback`. The primary is retried
    /// on every call until a cooldown is set.
    pub fn new(primary: Arc<dyn WindowStore>, fallback: MemoryWindowStore) -> Self {
        Self {
            primary,
            fallback,
            fallbacks: AtomicU64::new(0),
            cooldown: Duration::ZERO,
            suspended_until: Mutex::new(None),
        }
    }

    /// Skip the primary for `cooldown` after any of its calls fails.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// The in-memory fallback store.
    pub fn fallback(&self) -> &MemoryWindowStore {
        &self.fallback
    }

    /// Calls answered by the fallback since creation.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Whether calls are currently bypassing the primary.
    pub fn is_suspended(&self) -> bool {
        let now = self.fallback.clock().now();
        let suspended_until = *self.suspended_until.lock();
        suspended_until.is_some_and(|until| until > now)
    }

    fn skipped(&self, operation: &'static str) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        trace!(operation, "Primary store cooling down, answering from memory");
    }

    fn degraded(&self, operation: &'static str, error: &dyn std::error::Error) {
        let total = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.cooldown.is_zero() {
            *self.suspended_until.lock() = Some(offset(self.fallback.clock().now(), self.cooldown));
        }
        warn!(
            operation,
            error = %error,
            primary = %self.primary.backend(),
            fallbacks = total,
            cooldown = ?self.cooldown,
            "Window store unavailable, falling back to memory"
        );
    }
}

impl std::fmt::Debug for FailoverStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverStore")
            .field("primary", &self.primary.backend())
            .field("fallbacks", &self.fallback_count())
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// Try the primary unless it is cooling down, answer from the fallback on
/// error.
macro_rules! fail_open {
    ($self:ident, $op:literal, $call:ident($($arg:expr),*)) => {
        if $self.is_suspended() {
            $self.skipped($op);
            $self.fallback.$call($($arg),*).await
        } else {
            match $self.primary.$call($($arg),*).await {
                Ok(value) => Ok(value),
                Err(error) => {
                    $self.degraded($op, &error);
                    $self.fallback.$call($($arg),*).await
                }
            }
        }
    };
}

#[async_trait]
impl WindowStore for FailoverStore {
    fn backend(&self) -> Backend {
        self.primary.backend()
    }

    async fn increment(&self, key: &WindowKey, window: Duration) -> StoreResult<WindowCount> {
        fail_open!(self, "increment", increment(key, window))
    }

    async fn get_block(&self, key: &WindowKey) -> StoreResult<Option<DateTime<Utc>>> {
        fail_open!(self, "get_block", get_block(key))
    }

    async fn set_block(&self, key: &WindowKey, until: DateTime<Utc>) -> StoreResult<()> {
        fail_open!(self, "set_block", set_block(key, until))
    }

    async fn reset(&self, key: &WindowKey) -> StoreResult<()> {
        // Local state may hold windows counted while the primary was down.
        self.fallback.reset(key).await?;
        fail_open!(self, "reset", reset(key))
    }

    async fn whitelisted_until(&self, identifier: &str) -> StoreResult<Option<DateTime<Utc>>> {
        fail_open!(self, "whitelisted_until", whitelisted_until(identifier))
    }

    async fn set_whitelist(&self, identifier: &str, until: DateTime<Utc>) -> StoreResult<()> {
        self.fallback.set_whitelist(identifier, until).await?;
        fail_open!(self, "set_whitelist", set_whitelist(identifier, until))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.primary.ping().await
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.fallback.len())
    }
}
