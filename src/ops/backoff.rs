//! Verification of the escalating penalty schedule.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::ratelimit::EscalationTracker;

/// One rung of the backoff ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackoffStep {
    /// Violations recorded before this rung was measured
    pub violations: u32,
    /// `base * 2^violations`, clamped to the ceiling
    pub expected: Duration,
    /// What the tracker computed
    pub actual: Duration,
}

impl BackoffStep {
    /// Whether the tracker agreed with the expected penalty.
    pub fn matches(&self) -> bool {
        self.expected == self.actual
    }
}

/// Result of walking a tracker through successive violations.
#[derive(Debug, Clone, Serialize)]
pub struct BackoffReport {
    /// Base penalty the ladder started from
    pub base: Duration,
    /// One entry per violation count, starting at zero
    pub steps: Vec<BackoffStep>,
    /// Backoff observed after resetting the record
    pub after_reset: Duration,
}

impl BackoffReport {
    /// Every rung matched and the reset restored the base.
    pub fn passed(&self) -> bool {
        self.steps.iter().all(BackoffStep::matches) && self.after_reset == self.base
    }
}

/// Drives an [`EscalationTracker`] and checks it against `base * 2^k`.
#[derive(Debug, Clone)]
pub struct BackoffTester {
    tracker: EscalationTracker,
}

impl BackoffTester {
    /// Create a tester over `tracker`.
    pub fn new(tracker: EscalationTracker) -> Self {
        Self { tracker }
    }

    /// Record `violations` violations for `identifier`, checking the
    /// penalty before the first and after each one, then reset.
    ///
    /// The identifier's record is always cleared afterwards.
    pub fn run(&self, identifier: &str, base: Duration, violations: u32) -> BackoffReport {
        self.tracker.reset_violations(identifier);

        let mut steps = Vec::with_capacity(violations as usize + 1);
        for k in 0..=violations {
            if k > 0 {
                self.tracker.record_violation(identifier, base);
            }
            let step = BackoffStep {
                violations: k,
                expected: self.expected(base, k),
                actual: self.tracker.calculate_backoff(identifier, base),
            };
            if !step.matches() {
                warn!(
                    violations = k,
                    expected = ?step.expected,
                    actual = ?step.actual,
                    "Backoff mismatch"
                );
            }
            steps.push(step);
        }

        self.tracker.reset_violations(identifier);
        let after_reset = self.tracker.calculate_backoff(identifier, base);

        let report = BackoffReport {
            base,
            steps,
            after_reset,
        };
        info!(identifier, passed = report.passed(), "Backoff verification finished");
        report
    }

    /// `base * 2^k` in milliseconds, clamped into `[base, max_backoff]`.
    fn expected(&self, base: Duration, k: u32) -> Duration {
        let base_ms = base.as_millis();
        let scaled = 2u128
            .checked_pow(k)
            .and_then(|factor| base_ms.checked_mul(factor))
            .unwrap_or(u128::MAX);
        let capped = scaled.min(self.tracker.max_backoff().as_millis()).max(base_ms);
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }
}
