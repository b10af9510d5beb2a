mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::ops::{bench, Admin, BackoffTester, BenchConfig, Monitor, Pacing, SimulationPlan, Simulator};
use ratewarden::ratelimit::{
    ClientRequest, Clock, EscalationTracker, MockClock, PolicyName, PolicyRegistry, RateLimiter,
};
use ratewarden::response::AdmissionResponse;

use args::{Args, BackoffArgs, BenchArgs, CheckArgs, Command, SimulateArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = WardenConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config, &args);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewarden");

    match args.command {
        Command::Policies => policies(&config),
        Command::Check(check_args) => check(&config, check_args).await,
        Command::Simulate(simulate_args) => simulate(&config, simulate_args).await,
        Command::Backoff(backoff_args) => backoff(&config, backoff_args),
        Command::Bench(bench_args) => run_bench(&config, bench_args).await,
        Command::Monitor { once } => monitor(&config, once).await,
        Command::Reset { identifier, policy } => reset(&config, &identifier, policy).await,
        Command::Whitelist { identifier, minutes } => whitelist(&config, &identifier, minutes).await,
    }
}

/// Install the tracing subscriber. Logs go to stderr so stdout stays
/// machine-readable.
fn init_logging(config: &WardenConfig, args: &Args) {
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if args.json_logs || config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn policies(config: &WardenConfig) -> anyhow::Result<()> {
    let registry = PolicyRegistry::with_overrides(&config.policies)?;

    println!("{:<16} {:>8} {:>8} {:>8}  escalating", "policy", "capacity", "window", "block");
    for policy in registry.policies() {
        println!(
            "{:<16} {:>8} {:>7}s {:>7}s  {}",
            policy.name().as_str(),
            policy.capacity(),
            policy.window().as_secs(),
            policy.block().as_secs(),
            policy.escalating()
        );
    }
    Ok(())
}

async fn check(config: &WardenConfig, args: CheckArgs) -> anyhow::Result<()> {
    let limiter = RateLimiter::from_config(config).await?;
    let policy = PolicyName::from(args.policy);

    let identifier = match args.identifier {
        Some(identifier) => identifier,
        None => {
            let mut builder = ClientRequest::builder();
            if let Some(user) = args.user {
                builder = builder.user(user);
            }
            if let Some(forwarded_for) = args.forwarded_for {
                builder = builder.forwarded_for(forwarded_for);
            }
            if let Some(addr) = args.addr {
                builder = builder.direct_addr(addr);
            }
            builder.build().resolve()
        }
    };

    let rule = limiter.registry().get(&policy)?.clone();
    for _ in 0..args.count.max(1) {
        let decision = limiter.check(&identifier, &policy).await?;
        let response = AdmissionResponse::from_decision(&decision, &rule, limiter.clock().now());

        let status = response
            .status
            .map_or_else(|| "pass".to_string(), |code| code.to_string());
        let headers: Vec<String> = response
            .headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect();
        println!("{} {} [{}]", identifier, status, headers.join(", "));

        if let Some(body) = response.body_json() {
            println!("{}", body);
        }
    }
    Ok(())
}

async fn simulate(config: &WardenConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let simulator = if args.real_time {
        Simulator::new(Arc::new(RateLimiter::from_config(config).await?), Pacing::RealTime)
    } else {
        let clock = MockClock::starting_now();
        let limiter = RateLimiter::builder()
            .registry(PolicyRegistry::with_overrides(&config.policies)?)
            .clock(Arc::new(clock.clone()))
            .max_backoff(Duration::from_secs(config.escalation.max_backoff_secs))
            .decay_factor(config.escalation.decay_factor)
            .build();
        Simulator::new(Arc::new(limiter), Pacing::Virtual(clock))
    };

    let plan = SimulationPlan {
        identifier: args.identifier,
        policy: PolicyName::from(args.policy),
        requests: args.requests,
        delay: Duration::from_millis(args.delay_ms),
    };

    let report = simulator.run(&plan).await?;
    print_json(&report)
}

fn backoff(config: &WardenConfig, args: BackoffArgs) -> anyhow::Result<()> {
    let base = match args.base_secs {
        Some(secs) => Duration::from_secs(secs),
        None => PolicyRegistry::with_overrides(&config.policies)?
            .get(&PolicyName::Auth)?
            .block(),
    };

    let tracker = EscalationTracker::new()
        .with_max_backoff(Duration::from_secs(config.escalation.max_backoff_secs))
        .with_decay_factor(config.escalation.decay_factor);
    let report = BackoffTester::new(tracker).run("backoff-check", base, args.violations);

    print_json(&report)?;
    anyhow::ensure!(report.passed(), "backoff schedule does not match base * 2^k");
    Ok(())
}

async fn run_bench(config: &WardenConfig, args: BenchArgs) -> anyhow::Result<()> {
    let limiter = Arc::new(RateLimiter::from_config(config).await?);
    let bench_config = BenchConfig {
        concurrency: args.concurrency,
        requests_per_task: args.requests,
        identifiers: args.identifiers,
        policy: PolicyName::from(args.policy),
    };

    let report = bench::run(limiter, &bench_config).await?;
    print_json(&report)
}

async fn monitor(config: &WardenConfig, once: bool) -> anyhow::Result<()> {
    let limiter = Arc::new(RateLimiter::from_config(config).await?);
    let monitor = Monitor::new(limiter.clone(), config.monitor.clone());

    if once {
        return print_json(&monitor.report().await);
    }

    let sweeper = limiter.start_sweeper(Duration::from_secs(config.store.sweep_interval_secs));
    let handle = monitor.spawn();

    shutdown_signal().await;

    handle.stop().await;
    sweeper.stop().await;
    info!("Ratewarden monitor stopped");
    Ok(())
}

/// Limiter for a one-shot admin command, refused when it could only touch
/// this process's memory.
async fn shared_admin(config: &WardenConfig) -> anyhow::Result<Admin> {
    let admin = Admin::new(Arc::new(RateLimiter::from_config(config).await?));
    admin.ensure_shared()?;
    Ok(admin)
}

async fn reset(config: &WardenConfig, identifier: &str, policy: Option<String>) -> anyhow::Result<()> {
    let admin = shared_admin(config).await?;

    match policy {
        Some(policy) => {
            let policy = PolicyName::from(policy);
            admin.reset(identifier, &policy).await?;
            println!("reset {} under {}", identifier, policy);
        }
        None => {
            let policies = admin.reset_all(identifier).await?;
            let names: Vec<String> = policies.iter().map(ToString::to_string).collect();
            println!("reset {} under {}", identifier, names.join(", "));
        }
    }
    Ok(())
}

async fn whitelist(config: &WardenConfig, identifier: &str, minutes: u64) -> anyhow::Result<()> {
    let admin = shared_admin(config).await?;
    let until = admin.whitelist(identifier, minutes).await?;
    println!("whitelisted {} until {}", identifier, until.to_rfc3339());
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
