//! Administrative actions on client identifiers.
//!
//! Authorizing the caller is left to whatever exposes these operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::{Backend, LimiterStats, PolicyName, RateLimiter};

/// Admin surface over a shared [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct Admin {
    limiter: Arc<RateLimiter>,
}

impl Admin {
    /// Wrap `limiter`. Pair with [`Admin::ensure_shared`] when the actions
    /// must reach other processes.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Fail unless the limiter shares its state with other processes.
    ///
    /// A memory-backed limiter built only to run one admin command holds
    /// nothing any serving process can see, so a reset or whitelist through
    /// it would report success while changing nothing.
    pub fn ensure_shared(&self) -> Result<()> {
        match self.limiter.backend() {
            Backend::Memory => Err(WardenError::Config(
                "admin commands need a shared store; set store.redis_url and make sure Redis is reachable"
                    .to_string(),
            )),
            Backend::Redis => Ok(()),
        }
    }

    /// Clear the window, block and violation history of `identifier` under
    /// one policy.
    pub async fn reset(&self, identifier: &str, policy: &PolicyName) -> Result<()> {
        self.limiter.reset(identifier, policy).await
    }

    /// Clear `identifier` under every registered policy.
    ///
    /// Returns the policies that were reset.
    pub async fn reset_all(&self, identifier: &str) -> Result<Vec<PolicyName>> {
        let names: Vec<PolicyName> = self
            .limiter
            .registry()
            .policies()
            .into_iter()
            .map(|policy| policy.name().clone())
            .collect();

        for name in &names {
            self.limiter.reset(identifier, name).await?;
        }

        info!(identifier, policies = names.len(), "Reset identifier across all policies");
        Ok(names)
    }

    /// Let every request from `identifier` through for `minutes` minutes.
    pub async fn whitelist(&self, identifier: &str, minutes: u64) -> Result<DateTime<Utc>> {
        if minutes == 0 {
            return Err(WardenError::Config(
                "whitelist duration must be at least one minute".to_string(),
            ));
        }
        let duration = Duration::from_secs(minutes.saturating_mul(60));
        self.limiter.whitelist(identifier, duration).await
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LimiterStats {
        self.limiter.stats()
    }
}
