//! In-memory window store.
//!
//! Correct only while a single process serves all traffic for a key. It is
//! used on its own when no Redis URL is configured, and as the per-call
//! fallback when Redis cannot be reached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{Backend, StoreResult, WindowCount, WindowStore};
use crate::ratelimit::clock::{offset, Clock, SystemClock};
use crate::ratelimit::key::WindowKey;

/// Counter and block state for one window key.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u64,
    reset_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl WindowEntry {
    /// An entry whose window has already ended.
    fn expired(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            reset_at: now,
            blocked_until: None,
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.reset_at > now || self.blocked_until.is_some_and(|until| until > now)
    }
}

/// Process-local window store backed by a sharded map.
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Debug, Clone)]
pub struct MemoryWindowStore {
    windows: Arc<DashMap<String, WindowEntry>>,
    whitelist: Arc<DashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryWindowStore {
    /// Create an empty store reading time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            whitelist: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Remove entries whose window and block have both ended, and expired
    /// whitelist entries. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len() + self.whitelist.len();

        self.windows.retain(|_, entry| entry.is_live(now));
        self.whitelist.retain(|_, until| *until > now);

        before.saturating_sub(self.windows.len() + self.whitelist.len())
    }

    /// Number of window entries currently held.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window entries are held.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task runs until the returned handle is stopped or dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> SweepHandle {
        self.spawn_sweeper_with(every, || 0)
    }

    /// Like [`spawn_sweeper`](Self::spawn_sweeper), also running `also` on
    /// every tick. `also` returns how many entries it removed.
    pub fn spawn_sweeper_with<F>(&self, every: Duration, also: F) -> SweepHandle
    where
        F: Fn() -> usize + Send + 'static,
    {
        let store = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        let others = also();
                        if removed > 0 || others > 0 {
                            debug!(
                                removed,
                                others,
                                remaining = store.len(),
                                "Swept expired rate limit state"
                            );
                        }
                    }
                }
            }

            debug!("Window sweeper stopped");
        });

        debug!(interval = ?every, "Window sweeper started");

        SweepHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    async fn increment(&self, key: &WindowKey, window: Duration) -> StoreResult<WindowCount> {
        let now = self.clock.now();
        let mut entry = self
            .windows
            .entry(key.counter_key())
            .or_insert_with(|| WindowEntry::expired(now));

        if entry.reset_at <= now {
            entry.count = 1;
            entry.reset_at = offset(now, window);
            trace!(key = %key, reset_at = %entry.reset_at, "Starting new window");
        } else {
            entry.count += 1;
        }

        Ok(WindowCount {
            count: entry.count,
            reset_at: entry.reset_at,
        })
    }

    async fn get_block(&self, key: &WindowKey) -> StoreResult<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        Ok(self
            .windows
            .get(&key.counter_key())
            .and_then(|entry| entry.blocked_until)
            .filter(|until| *until > now))
    }

    async fn set_block(&self, key: &WindowKey, until: DateTime<Utc>) -> StoreResult<()> {
        let now = self.clock.now();
        self.windows
            .entry(key.counter_key())
            .or_insert_with(|| WindowEntry::expired(now))
            .blocked_until = Some(until);
        Ok(())
    }

    async fn reset(&self, key: &WindowKey) -> StoreResult<()> {
        self.windows.remove(&key.counter_key());
        Ok(())
    }

    async fn whitelisted_until(&self, identifier: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        Ok(self
            .whitelist
            .get(identifier)
            .map(|until| *until)
            .filter(|until| *until > now))
    }

    async fn set_whitelist(&self, identifier: &str, until: DateTime<Utc>) -> StoreResult<()> {
        self.whitelist.insert(identifier.to_string(), until);
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// Owns the background sweep task of a [`MemoryWindowStore`].
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the sweep task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
