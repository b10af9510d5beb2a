//! Throughput and latency benchmark for the admission path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use hdrhistogram::Histogram;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, WardenError};
use crate::ratelimit::{PolicyName, RateLimiter};

/// Shape of a benchmark run.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Concurrent tasks issuing checks
    pub concurrency: usize,
    /// Checks issued by each task
    pub requests_per_task: usize,
    /// Distinct client identifiers the tasks pick from at random
    pub identifiers: usize,
    /// Policy every check runs under
    pub policy: PolicyName,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            requests_per_task: 1000,
            identifiers: 256,
            policy: PolicyName::General,
        }
    }
}

/// Aggregated benchmark results.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    /// Checks issued across all tasks
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    /// Wall time of the whole run
    pub elapsed: Duration,
    /// Checks per second
    pub throughput: f64,
    pub p50: Duration,
    pub p99: Duration,
    /// Slowest single check
    pub max: Duration,
}

struct TaskResult {
    histogram: Histogram<u64>,
    allowed: u64,
    denied: u64,
}

/// Run `config` against `limiter`.
///
/// Identifiers are namespaced by a fresh run id so repeated runs against a
/// shared store do not see each other's windows.
pub async fn run(limiter: Arc<RateLimiter>, config: &BenchConfig) -> Result<BenchReport> {
    if config.concurrency == 0 || config.identifiers == 0 {
        return Err(WardenError::Tooling(
            "concurrency and identifiers must be greater than zero".to_string(),
        ));
    }

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let identifiers: Arc<Vec<String>> = Arc::new(
        (0..config.identifiers)
            .map(|i| format!("bench:{}:{}", &run_id[..8], i))
            .collect(),
    );

    info!(
        concurrency = config.concurrency,
        requests_per_task = config.requests_per_task,
        identifiers = config.identifiers,
        policy = %config.policy,
        "Starting benchmark"
    );

    let started = Instant::now();
    let tasks = (0..config.concurrency).map(|_| {
        let limiter = limiter.clone();
        let identifiers = identifiers.clone();
        let policy = config.policy.clone();
        let count = config.requests_per_task;

        tokio::spawn(async move {
            let mut histogram = Histogram::<u64>::new(3)
                .map_err(|e| WardenError::Tooling(format!("histogram: {}", e)))?;
            let mut rng = StdRng::from_entropy();
            let mut allowed = 0;
            let mut denied = 0;

            for _ in 0..count {
                let identifier = &identifiers[rng.gen_range(0..identifiers.len())];
                let start = Instant::now();
                let decision = limiter.check(identifier, &policy).await?;
                histogram.saturating_record(start.elapsed().as_micros() as u64);

                if decision.allowed {
                    allowed += 1;
                } else {
                    denied += 1;
                }
            }

            Ok::<_, WardenError>(TaskResult {
                histogram,
                allowed,
                denied,
            })
        })
    });

    let joined = try_join_all(tasks)
        .await
        .map_err(|e| WardenError::Tooling(format!("benchmark task failed: {}", e)))?;
    let elapsed = started.elapsed();

    let mut histogram = Histogram::<u64>::new(3)
        .map_err(|e| WardenError::Tooling(format!("histogram: {}", e)))?;
    let mut allowed = 0;
    let mut denied = 0;
    for result in joined {
        let result = result?;
        histogram
            .add(&result.histogram)
            .map_err(|e| WardenError::Tooling(format!("histogram: {}", e)))?;
        allowed += result.allowed;
        denied += result.denied;
    }

    let total = allowed + denied;
    let throughput = if elapsed.is_zero() {
        0.0
    } else {
        total as f64 / elapsed.as_secs_f64()
    };

    let report = BenchReport {
        total,
        allowed,
        denied,
        elapsed,
        throughput,
        p50: Duration::from_micros(histogram.value_at_quantile(0.50)),
        p99: Duration::from_micros(histogram.value_at_quantile(0.99)),
        max: Duration::from_micros(histogram.max()),
    };

    debug!(report = ?report, "Benchmark report");
    info!(
        total,
        throughput = %format!("{:.0}", throughput),
        p99 = ?report.p99,
        "Benchmark finished"
    );
    Ok(report)
}
