//! Exponential backoff for repeat offenders.
//!
//! Each client identifier subject to an escalating policy carries a
//! violation count. The effective penalty is `base * 2^count`, capped at
//! `max_backoff`. A record decays back to zero once the client has gone
//! `decay_factor` times its current backoff without a new violation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};

/// Default ceiling on any computed backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);
/// Default multiple of the current backoff after which a record decays.
pub const DEFAULT_DECAY_FACTOR: u32 = 2;
/// Exponents beyond this already exceed any sane ceiling.
const MAX_EXPONENT: u32 = 32;

/// Consecutive violations for one client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationRecord {
    /// Consecutive policy breaches
    pub violation_count: u32,
    /// When the last breach happened
    pub last_violation_at: DateTime<Utc>,
    /// Base penalty of the policy the breach was recorded under
    pub base: Duration,
}

/// Tracks violations and computes escalating penalties.
#[derive(Debug, Clone)]
pub struct EscalationTracker {
    records: Arc<DashMap<String, ViolationRecord>>,
    max_backoff: Duration,
    decay_factor: u32,
    clock: Arc<dyn Clock>,
}

impl EscalationTracker {
    /// Create a tracker with the default ceiling and decay.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a tracker reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            max_backoff: DEFAULT_MAX_BACKOFF,
            decay_factor: DEFAULT_DECAY_FACTOR,
            clock,
        }
    }

    /// Override the backoff ceiling.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Override the decay factor. Zero disables automatic decay.
    pub fn with_decay_factor(mut self, decay_factor: u32) -> Self {
        self.decay_factor = decay_factor;
        self
    }

    /// The backoff ceiling.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// `base * 2^violations`, capped at the ceiling.
    ///
    /// Never shorter than `base`, even if `base` itself exceeds the ceiling.
    pub fn backoff_for(&self, base: Duration, violations: u32) -> Duration {
        let factor = 1u32
            .checked_shl(violations.min(MAX_EXPONENT))
            .unwrap_or(u32::MAX);
        base.checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff)
            .max(base)
    }

    /// Effective penalty for `identifier` given the policy's base penalty.
    ///
    /// Applies decay first, so a client that has behaved long enough is
    /// back to `base`.
    pub fn calculate_backoff(&self, identifier: &str, base: Duration) -> Duration {
        let violations = self.current_violations(identifier, base);
        self.backoff_for(base, violations)
    }

    /// Count one more violation for `identifier` under a policy whose base
    /// penalty is `base`. Returns the new count.
    pub fn record_violation(&self, identifier: &str, base: Duration) -> u32 {
        let now = self.clock.now();
        let mut record = self
            .records
            .entry(identifier.to_string())
            .or_insert(ViolationRecord {
                violation_count: 0,
                last_violation_at: now,
                base,
            });

        record.violation_count = record.violation_count.saturating_add(1);
        record.last_violation_at = now;
        record.base = base;

        debug!(
            identifier,
            violations = record.violation_count,
            "Recorded rate limit violation"
        );
        record.violation_count
    }

    /// Forget every violation of `identifier`.
    pub fn reset_violations(&self, identifier: &str) {
        if self.records.remove(identifier).is_some() {
            info!(identifier, "Reset violation record");
        }
    }

    /// The stored record for `identifier`, without applying decay.
    pub fn record(&self, identifier: &str) -> Option<ViolationRecord> {
        self.records.get(identifier).map(|record| *record)
    }

    /// Number of identifiers with a violation record.
    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Drop every record that has decayed. Returns the number removed.
    ///
    /// Decay is otherwise only noticed when the same identifier offends
    /// again, so records of clients that never return would live forever.
    pub fn sweep(&self) -> usize {
        if self.decay_factor == 0 {
            return 0;
        }

        let now = self.clock.now();
        let before = self.records.len();
        self.records
            .retain(|_, record| !self.has_decayed(record, record.base, now));
        before.saturating_sub(self.records.len())
    }

    /// Violation count after decay, removing the record if it decayed.
    fn current_violations(&self, identifier: &str, base: Duration) -> u32 {
        let Some(record) = self.record(identifier) else {
            return 0;
        };

        if self.has_decayed(&record, base, self.clock.now()) {
            self.records.remove(identifier);
            debug!(identifier, "Violation record decayed");
            return 0;
        }

        record.violation_count
    }

    fn has_decayed(&self, record: &ViolationRecord, base: Duration, now: DateTime<Utc>) -> bool {
        if self.decay_factor == 0 {
            return false;
        }

        let quiet_for = (now - record.last_violation_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let decay_after = self
            .backoff_for(base, record.violation_count)
            .checked_mul(self.decay_factor)
            .unwrap_or(Duration::MAX);

        quiet_for >= decay_after
    }
}

impl Default for EscalationTracker {
    fn default() -> Self {
        Self::new()
    }
}
