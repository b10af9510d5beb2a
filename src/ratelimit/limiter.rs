//! Core rate limiter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::clock::{offset, Clock, SystemClock};
use super::decision::Decision;
use super::escalation::{EscalationTracker, DEFAULT_DECAY_FACTOR, DEFAULT_MAX_BACKOFF};
use super::key::WindowKey;
use super::policy::{PolicyName, PolicyRegistry};
use super::store::{
    Backend, FailoverStore, MemoryWindowStore, RedisStoreConfig, RedisWindowStore, SweepHandle,
    WindowCount, WindowStore,
};
use crate::config::WardenConfig;
use crate::error::Result;

/// How long the limiter answers from memory after the distributed store fails.
pub const DEFAULT_FAILOVER_COOLDOWN: Duration = Duration::from_secs(1);

/// Fixed-window admission with a separate penalty block per key.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    registry: PolicyRegistry,
    /// The store every check goes through
    store: Arc<dyn WindowStore>,
    /// Process-local state; the whole store in memory mode, the fallback otherwise
    memory: MemoryWindowStore,
    failover: Option<Arc<FailoverStore>>,
    escalation: EscalationTracker,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    whitelisted: AtomicU64,
    violations: AtomicU64,
}

/// Point-in-time counters for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Backend answering checks
    pub backend: Backend,
    /// Checks performed
    pub checks: u64,
    /// Checks that admitted the request
    pub allowed: u64,
    /// Checks that denied the request
    pub denied: u64,
    /// Admissions through the whitelist
    pub whitelisted: u64,
    /// Requests that tipped a client into a block
    pub violations: u64,
    /// Store calls answered by the memory fallback
    pub fallbacks: u64,
    /// Window entries held in process memory
    pub memory_entries: usize,
    /// Identifiers with an escalation record
    pub tracked_offenders: usize,
}

/// Outcome of probing the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    /// Backend checked
    pub backend: Backend,
    /// Whether it answered
    pub reachable: bool,
    /// Round-trip time of the check
    pub latency: Duration,
    /// Failure description when unreachable
    pub error: Option<String>,
}

impl RateLimiter {
    /// Memory-only limiter with the built-in policies.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new builder.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Build a limiter from configuration.
    ///
    /// When a Redis URL is configured but cannot be reached at startup the
    /// limiter runs memory-only rather than refusing to start.
    pub async fn from_config(config: &WardenConfig) -> Result<Self> {
        let registry = PolicyRegistry::with_overrides(&config.policies)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        let mut builder = Self::builder()
            .registry(registry)
            .clock(clock.clone())
            .max_backoff(Duration::from_secs(config.escalation.max_backoff_secs))
            .decay_factor(config.escalation.decay_factor);

        if let Some(url) = &config.store.redis_url {
            let redis_config = RedisStoreConfig {
                url: url.clone(),
                command_timeout: Duration::from_millis(config.store.command_timeout_ms),
                connect_timeout: Duration::from_millis(config.store.connect_timeout_ms),
            };
            builder = builder.failover_cooldown(Duration::from_millis(config.store.failover_cooldown_ms));

            match RedisWindowStore::connect_with_clock(&redis_config, clock).await {
                Ok(store) => builder = builder.distributed(Arc::new(store)),
                Err(e) => warn!(error = %e, "Redis unreachable at startup, using memory store only"),
            }
        } else {
            info!("No Redis URL configured, using memory store only");
        }

        Ok(builder.build())
    }

    /// Decide whether `identifier` may make one more request under `policy`.
    ///
    /// Fails only for an unknown policy, or for a store error that no
    /// fallback absorbed.
    ///
    /// Concurrent over-limit requests from one client record a single
    /// violation between them.
    pub async fn check(&self, identifier: &str, policy: &PolicyName) -> Result<Decision> {
        let policy = self.registry.get(policy)?;
        let now = self.clock.now();
        self.counters.checks.fetch_add(1, Ordering::Relaxed);

        trace!(identifier, policy = %policy.name(), "Checking rate limit");

        if self.store.whitelisted_until(identifier).await?.is_some() {
            self.counters.whitelisted.fetch_add(1, Ordering::Relaxed);
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            trace!(identifier, "Whitelisted, skipping rate limit");
            return Ok(Decision::whitelisted(
                policy.capacity(),
                offset(now, policy.window()),
            ));
        }

        let key = WindowKey::new(policy.name(), identifier);

        if let Some(blocked_until) = self.store.get_block(&key).await? {
            if blocked_until > now {
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, blocked_until = %blocked_until, "Client is blocked");
                return Ok(Decision::blocked(blocked_until));
            }
        }

        let WindowCount { count, reset_at } = self.store.increment(&key, policy.window()).await?;

        // Only the request that takes the window to exactly capacity + 1
        // opens a block and counts as a violation. Requests racing it, or
        // arriving after the store lost the block, are denied until the
        // existing block or the window ends.
        if count > policy.capacity().saturating_add(1) {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            let denied_until = match self.store.get_block(&key).await? {
                Some(blocked_until) if blocked_until > now => blocked_until,
                _ => reset_at,
            };
            trace!(key = %key, count, denied_until = %denied_until, "Window exhausted, denying");
            return Ok(Decision::blocked(denied_until));
        }

        if count > policy.capacity() {
            let penalty = if policy.escalating() {
                self.escalation.calculate_backoff(identifier, policy.block())
            } else {
                policy.block()
            };
            let blocked_until = offset(now, penalty);
            self.store.set_block(&key, blocked_until).await?;

            if policy.escalating() {
                self.escalation.record_violation(identifier, policy.block());
            }
            self.counters.violations.fetch_add(1, Ordering::Relaxed);
            self.counters.denied.fetch_add(1, Ordering::Relaxed);

            debug!(
                key = %key,
                count,
                capacity = policy.capacity(),
                penalty = ?penalty,
                "Rate limit exceeded, blocking client"
            );
            return Ok(Decision::blocked(blocked_until));
        }

        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(Decision::allowed(policy.capacity() - count, reset_at))
    }

    /// Restore full capacity for `identifier` under `policy` and forget its
    /// violation history.
    pub async fn reset(&self, identifier: &str, policy: &PolicyName) -> Result<()> {
        let policy = self.registry.get(policy)?;
        let key = WindowKey::new(policy.name(), identifier);

        self.store.reset(&key).await?;
        self.escalation.reset_violations(identifier);

        info!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// Admit every request from `identifier` for `duration`.
    ///
    /// Returns when the whitelist entry expires.
    pub async fn whitelist(&self, identifier: &str, duration: Duration) -> Result<DateTime<Utc>> {
        let until = offset(self.clock.now(), duration);
        self.store.set_whitelist(identifier, until).await?;

        info!(identifier, until = %until, "Client whitelisted");
        Ok(until)
    }

    /// Ping the store and time the round trip.
    pub async fn health_check(&self) -> StoreHealth {
        let started = Instant::now();
        let result = self.store.ping().await;

        StoreHealth {
            backend: self.store.backend(),
            reachable: result.is_ok(),
            latency: started.elapsed(),
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Snapshot of the limiter's counters.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            backend: self.store.backend(),
            checks: self.counters.checks.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            whitelisted: self.counters.whitelisted.load(Ordering::Relaxed),
            violations: self.counters.violations.load(Ordering::Relaxed),
            fallbacks: self.failover.as_ref().map_or(0, |f| f.fallback_count()),
            memory_entries: self.memory.len(),
            tracked_offenders: self.escalation.tracked(),
        }
    }

    /// Start the periodic sweep of process-local windows and decayed
    /// escalation records.
    pub fn start_sweeper(&self, every: Duration) -> SweepHandle {
        let escalation = self.escalation.clone();
        self.memory.spawn_sweeper_with(every, move || escalation.sweep())
    }

    /// The policy registry.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// The escalation tracker.
    pub fn escalation(&self) -> &EscalationTracker {
        &self.escalation
    }

    /// The clock used for every decision.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Backend answering checks.
    pub fn backend(&self) -> Backend {
        self.store.backend()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend())
            .field("policies", &self.registry.policies().len())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RateLimiter`].
pub struct RateLimiterBuilder {
    registry: PolicyRegistry,
    clock: Arc<dyn Clock>,
    distributed: Option<Arc<dyn WindowStore>>,
    failover_cooldown: Duration,
    max_backoff: Duration,
    decay_factor: u32,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            registry: PolicyRegistry::builtin(),
            clock: Arc::new(SystemClock::new()),
            distributed: None,
            failover_cooldown: DEFAULT_FAILOVER_COOLDOWN,
            max_backoff: DEFAULT_MAX_BACKOFF,
            decay_factor: DEFAULT_DECAY_FACTOR,
        }
    }
}

impl RateLimiterBuilder {
    /// Use a custom policy registry.
    pub fn registry(mut self, registry: PolicyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Read time from `clock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share state through `store`, falling back to memory when it fails.
    pub fn distributed(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    /// Skip the distributed store for `cooldown` after it fails. Zero
    /// retries it on every call.
    pub fn failover_cooldown(mut self, cooldown: Duration) -> Self {
        self.failover_cooldown = cooldown;
        self
    }

    /// Ceiling for escalated penalties.
    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Quiet-period multiple after which violation records decay.
    pub fn decay_factor(mut self, decay_factor: u32) -> Self {
        self.decay_factor = decay_factor;
        self
    }

    /// Build the rate limiter.
    pub fn build(self) -> RateLimiter {
        let memory = MemoryWindowStore::with_clock(self.clock.clone());

        let cooldown = self.failover_cooldown;
        let failover = self.distributed.map(|primary| {
            Arc::new(FailoverStore::new(primary, memory.clone()).with_cooldown(cooldown))
        });
        let store: Arc<dyn WindowStore> = match &failover {
            Some(failover) => failover.clone(),
            None => Arc::new(memory.clone()),
        };

        let escalation = EscalationTracker::with_clock(self.clock.clone())
            .with_max_backoff(self.max_backoff)
            .with_decay_factor(self.decay_factor);

        RateLimiter {
            registry: self.registry,
            store,
            memory,
            failover,
            escalation,
            clock: self.clock,
            counters: Counters::default(),
        }
    }
}
