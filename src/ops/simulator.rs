//! Synthetic request streams against a single policy.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::ratelimit::{Clock, Decision, MockClock, PolicyName, RateLimiter};
use crate::response::retry_after;

/// How the simulator waits between requests.
#[derive(Debug, Clone)]
pub enum Pacing {
    /// Sleep for real
    RealTime,
    /// Advance a mock clock; the limiter must read time from the same clock
    Virtual(MockClock),
}

/// A run of `requests` checks for one identifier, `delay` apart.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    /// Client identifier every request is made as
    pub identifier: String,
    /// Policy every check runs under
    pub policy: PolicyName,
    /// Number of checks to make
    pub requests: u32,
    /// Pause after each check
    pub delay: Duration,
}

/// Outcome of one simulated request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedRequest {
    /// 1-based position in the run
    pub sequence: u32,
    /// What the limiter decided
    pub decision: Decision,
    /// Seconds to wait before retrying, when denied
    pub retry_after: Option<u64>,
}

/// Summary of a simulation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Identifier the plan ran as
    pub identifier: String,
    /// Name of the policy checked against
    pub policy: String,
    /// Requests let through
    pub allowed: u32,
    /// Requests rejected, whether by a new or an existing block
    pub denied: u32,
    /// Per-request outcomes in order
    pub requests: Vec<SimulatedRequest>,
}

/// Drives a [`RateLimiter`] with synthetic traffic.
#[derive(Debug)]
pub struct Simulator {
    limiter: Arc<RateLimiter>,
    pacing: Pacing,
}

impl Simulator {
    /// Create a simulator over `limiter`. With [`Pacing::Virtual`] the
    /// limiter must read time from the same mock clock.
    pub fn new(limiter: Arc<RateLimiter>, pacing: Pacing) -> Self {
        Self { limiter, pacing }
    }

    /// Simulator over a fresh memory limiter on virtual time, so long
    /// delays cost nothing.
    pub fn virtual_time() -> Self {
        let clock = MockClock::starting_now();
        let limiter = RateLimiter::builder()
            .clock(Arc::new(clock.clone()))
            .build();
        Self::new(Arc::new(limiter), Pacing::Virtual(clock))
    }

    /// The limiter being exercised.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute `plan` and tally the outcomes.
    pub async fn run(&self, plan: &SimulationPlan) -> Result<SimulationReport> {
        info!(
            identifier = %plan.identifier,
            policy = %plan.policy,
            requests = plan.requests,
            delay = ?plan.delay,
            "Starting simulation"
        );

        let mut report = SimulationReport {
            identifier: plan.identifier.clone(),
            policy: plan.policy.to_string(),
            allowed: 0,
            denied: 0,
            requests: Vec::with_capacity(plan.requests as usize),
        };

        for sequence in 1..=plan.requests {
            if sequence > 1 {
                self.pause(plan.delay).await;
            }

            let decision = self.limiter.check(&plan.identifier, &plan.policy).await?;
            let retry = decision
                .is_denied()
                .then(|| retry_after(&decision, self.limiter.clock().now()));

            if decision.allowed {
                report.allowed += 1;
            } else {
                report.denied += 1;
            }
            debug!(sequence, allowed = decision.allowed, remaining = decision.remaining, "Simulated request");

            report.requests.push(SimulatedRequest {
                sequence,
                decision,
                retry_after: retry,
            });
        }

        info!(allowed = report.allowed, denied = report.denied, "Simulation finished");
        Ok(report)
    }

    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        match &self.pacing {
            Pacing::RealTime => tokio::time::sleep(delay).await,
            Pacing::Virtual(clock) => clock.advance(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(policy: PolicyName, requests: u32, delay: Duration) -> SimulationPlan {
        SimulationPlan {
            identifier: "ip:10.0.0.1".to_string(),
            policy,
            requests,
            delay,
        }
    }

    #[tokio::test]
    async fn test_auth_burst() {
        let simulator = Simulator::virtual_time();
        let report = simulator
            .run(&plan(PolicyName::Auth, 6, Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(report.allowed, 5);
        assert_eq!(report.denied, 1);

        let remaining: Vec<u64> = report.requests[..5]
            .iter()
            .map(|r| r.decision.remaining)
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
        assert_eq!(report.requests[5].retry_after, Some(600));
        assert!(report.requests[0].retry_after.is_none());
    }

    #[tokio::test]
    async fn test_slow_traffic_never_denied() {
        let simulator = Simulator::virtual_time();
        let report = simulator
            .run(&plan(PolicyName::General, 3, Duration::from_secs(70)))
            .await
            .unwrap();

        assert_eq!(report.denied, 0);
        assert!(report.requests.iter().all(|r| r.decision.remaining == 99));
    }

    #[tokio::test]
    async fn test_real_time_pacing() {
        let limiter = Arc::new(RateLimiter::new());
        let simulator = Simulator::new(limiter, Pacing::RealTime);
        let report = simulator
            .run(&plan(PolicyName::Description, 3, Duration::from_millis(5)))
            .await
            .unwrap();

        assert_eq!(report.allowed, 3);
        assert_eq!(simulator.limiter().stats().checks, 3);
    }

    #[tokio::test]
    async fn test_unknown_policy_fails() {
        let simulator = Simulator::virtual_time();
        let result = simulator
            .run(&plan(PolicyName::from("missing"), 1, Duration::ZERO))
            .await;
        assert!(result.is_err());
    }
}
