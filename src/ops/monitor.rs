//! Periodic health reporting for a running limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::ratelimit::{Backend, Clock, LimiterStats, RateLimiter, StoreHealth};

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Store reachable and nothing to recommend
    Healthy,
    /// Admissions still work but something needs attention
    Degraded,
}

/// One health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// When the report was assembled
    pub checked_at: DateTime<Utc>,
    /// Overall classification
    pub state: HealthState,
    /// Result of pinging the store
    pub store: StoreHealth,
    /// Limiter counters at report time
    pub stats: LimiterStats,
    /// Operator-facing advice, empty when healthy
    pub recommendations: Vec<String>,
}

/// Builds health reports from a limiter's health check and counters.
#[derive(Debug, Clone)]
pub struct Monitor {
    limiter: Arc<RateLimiter>,
    config: MonitorConfig,
}

impl Monitor {
    /// Create a monitor over `limiter` using the given thresholds.
    pub fn new(limiter: Arc<RateLimiter>, config: MonitorConfig) -> Self {
        Self { limiter, config }
    }

    /// Check the store and assemble a report.
    pub async fn report(&self) -> HealthReport {
        let store = self.limiter.health_check().await;
        let stats = self.limiter.stats();
        let recommendations = self.recommendations(&store, &stats);

        let state = if store.reachable && recommendations.is_empty() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };

        HealthReport {
            checked_at: self.limiter.clock().now(),
            state,
            store,
            stats,
            recommendations,
        }
    }

    fn recommendations(&self, store: &StoreHealth, stats: &LimiterStats) -> Vec<String> {
        let mut out = Vec::new();

        if !store.reachable {
            out.push(
                "Distributed store unreachable; admissions are answered from process memory"
                    .to_string(),
            );
        } else if store.latency > Duration::from_millis(self.config.latency_warn_ms) {
            out.push(format!(
                "Store round trip took {}ms, above the {}ms threshold",
                store.latency.as_millis(),
                self.config.latency_warn_ms
            ));
        }

        if store.backend == Backend::Memory && stats.memory_entries > self.config.memory_entry_ceiling {
            out.push(format!(
                "Switch to a distributed store: {} in-memory windows exceed the ceiling of {}",
                stats.memory_entries, self.config.memory_entry_ceiling
            ));
        }

        if store.backend == Backend::Redis && stats.fallbacks > 0 {
            out.push(format!(
                "{} store calls fell back to memory since start",
                stats.fallbacks
            ));
        }

        out
    }

    /// Emit a report every `interval_secs` until the handle is stopped.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (report_tx, report_rx) = watch::channel(None);
        let period = Duration::from_secs(self.config.interval_secs.max(1));

        let task = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(period));
            info!(interval = ?period, "Health monitor started");

            loop {
                tokio::select! {
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let report = self.report().await;
                        log_report(&report);
                        if report_tx.send(Some(report)).is_err() {
                            debug!("No report subscribers left");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            info!("Health monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
            reports: report_rx,
        }
    }
}

fn log_report(report: &HealthReport) {
    match report.state {
        HealthState::Healthy => info!(
            backend = %report.store.backend,
            latency = ?report.store.latency,
            memory_entries = report.stats.memory_entries,
            checks = report.stats.checks,
            denied = report.stats.denied,
            "Rate limiter healthy"
        ),
        HealthState::Degraded => {
            for recommendation in &report.recommendations {
                warn!(backend = %report.store.backend, "{}", recommendation);
            }
        }
    }
}

/// Owns a running monitor task.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    reports: watch::Receiver<Option<HealthReport>>,
}

impl MonitorHandle {
    /// Receiver of the most recent report.
    pub fn subscribe(&self) -> watch::Receiver<Option<HealthReport>> {
        self.reports.clone()
    }

    /// The most recent report, if one has been produced.
    pub fn latest(&self) -> Option<HealthReport> {
        self.reports.borrow().clone()
    }

    /// Stop the monitor and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::store::UnreachableStore;
    use crate::ratelimit::PolicyName;

    #[tokio::test]
    async fn test_fresh_memory_limiter_is_healthy() {
        let monitor = Monitor::new(Arc::new(RateLimiter::new()), MonitorConfig::default());
        let report = monitor.report().await;

        assert_eq!(report.state, HealthState::Healthy);
        assert!(report.store.reachable);
        assert_eq!(report.store.backend, Backend::Memory);
        assert!(report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_recommends_distributed_store_above_ceiling() {
        let limiter = Arc::new(RateLimiter::new());
        for i in 0..5 {
            limiter.check(&format!("ip:10.0.0.{i}"), &PolicyName::General).await.unwrap();
        }

        let config = MonitorConfig {
            memory_entry_ceiling: 3,
            ..MonitorConfig::default()
        };
        let report = Monitor::new(limiter, config).report().await;

        assert_eq!(report.state, HealthState::Degraded);
        assert_eq!(report.stats.memory_entries, 5);
        assert!(report.recommendations[0].contains("distributed store"));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_degraded() {
        let limiter = RateLimiter::builder()
            .distributed(Arc::new(UnreachableStore))
            .build();
        let report = Monitor::new(Arc::new(limiter), MonitorConfig::default())
            .report()
            .await;

        assert_eq!(report.state, HealthState::Degraded);
        assert!(!report.store.reachable);
        assert!(report.recommendations[0].contains("unreachable"));
    }

    #[tokio::test]
    async fn test_spawned_monitor_publishes_reports() {
        let config = MonitorConfig {
            interval_secs: 1,
            ..MonitorConfig::default()
        };
        let handle = Monitor::new(Arc::new(RateLimiter::new()), config).spawn();
        let mut reports = handle.subscribe();

        // The first interval tick completes immediately.
        tokio::time::timeout(Duration::from_secs(5), reports.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(handle.latest().is_some());

        handle.stop().await;
    }
}
