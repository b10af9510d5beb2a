use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Request admission and rate limiting")]
pub struct Args {
    /// Path to a YAML configuration file
    #[arg(long, global = true, env = "RATEWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter directive, overrides the configured level
    #[arg(long = "log-level", global = true, env = "RATEWARDEN_LOG")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the active policies
    Policies,

    /// Run admission checks and print the resulting response
    Check(CheckArgs),

    /// Send synthetic requests for one identifier
    Simulate(SimulateArgs),

    /// Verify the escalating penalty schedule
    Backoff(BackoffArgs),

    /// Measure admission throughput and latency
    Bench(BenchArgs),

    /// Report limiter health periodically until interrupted
    Monitor {
        /// Print a single report and exit
        #[arg(long)]
        once: bool,
    },

    /// Restore full capacity for an identifier (requires Redis)
    Reset {
        identifier: String,

        /// Policy to reset; every policy when omitted
        #[arg(long, short)]
        policy: Option<String>,
    },

    /// Admit every request from an identifier for a while (requires Redis)
    Whitelist {
        identifier: String,

        #[arg(long, short, default_value_t = 60)]
        minutes: u64,
    },
}

#[derive(Debug, ClapArgs)]
pub struct CheckArgs {
    /// Client identifier; derived from the request flags when omitted
    pub identifier: Option<String>,

    #[arg(long, short, default_value = "general")]
    pub policy: String,

    /// Authenticated user id
    #[arg(long)]
    pub user: Option<String>,

    /// Raw X-Forwarded-For value
    #[arg(long = "forwarded-for")]
    pub forwarded_for: Option<String>,

    /// Direct peer address
    #[arg(long)]
    pub addr: Option<String>,

    /// Number of consecutive checks
    #[arg(long, short = 'n', default_value_t = 1)]
    pub count: u32,
}

#[derive(Debug, ClapArgs)]
pub struct SimulateArgs {
    #[arg(long, short, default_value = "ip:127.0.0.1")]
    pub identifier: String,

    #[arg(long, short, default_value = "general")]
    pub policy: String,

    #[arg(long, short = 'n', default_value_t = 10)]
    pub requests: u32,

    /// Delay between requests in milliseconds
    #[arg(long = "delay-ms", default_value_t = 0)]
    pub delay_ms: u64,

    /// Sleep for real against the configured store instead of virtual time
    #[arg(long = "real-time")]
    pub real_time: bool,
}

#[derive(Debug, ClapArgs)]
pub struct BackoffArgs {
    /// Base penalty in seconds; the auth policy's block when omitted
    #[arg(long = "base-secs")]
    pub base_secs: Option<u64>,

    #[arg(long, short, default_value_t = 5)]
    pub violations: u32,
}

#[derive(Debug, ClapArgs)]
pub struct BenchArgs {
    #[arg(long, short, default_value_t = 16)]
    pub concurrency: usize,

    /// Checks per task
    #[arg(long, short = 'n', default_value_t = 1000)]
    pub requests: usize,

    /// Distinct identifiers to spread load over
    #[arg(long, default_value_t = 256)]
    pub identifiers: usize,

    #[arg(long, short, default_value = "general")]
    pub policy: String,
}
