//! Configuration management for Ratewarden.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::ratelimit::{PolicyConfig, PolicyRegistry};

/// Prefix for environment overrides, e.g. `RATEWARDEN__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Escalating penalty configuration
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Health monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Policies overriding or extending the built-in table
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; memory-only when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Initial connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long to answer from memory after a Redis call fails, in
    /// milliseconds; 0 retries Redis on every call
    #[serde(default = "default_failover_cooldown_ms")]
    pub failover_cooldown_ms: u64,

    /// Interval between sweeps of the in-memory store in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            failover_cooldown_ms: default_failover_cooldown_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_command_timeout_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_failover_cooldown_ms() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Escalating penalty configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Ceiling on any escalated block in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Violation records decay after this many multiples of the current
    /// backoff without a new violation; zero disables decay
    #[serde(default = "default_decay_factor")]
    pub decay_factor: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: default_max_backoff(),
            decay_factor: default_decay_factor(),
        }
    }
}

fn default_max_backoff() -> u64 {
    86_400
}

fn default_decay_factor() -> u32 {
    2
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between reports
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// In-memory entry count above which a distributed store is recommended
    #[serde(default = "default_memory_entry_ceiling")]
    pub memory_entry_ceiling: usize,

    /// Store round trips slower than this are flagged
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            memory_entry_ceiling: default_memory_entry_ceiling(),
            latency_warn_ms: default_latency_warn_ms(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_memory_entry_ceiling() -> usize {
    10_000
}

fn default_latency_warn_ms() -> u64 {
    100
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Layer an optional file and `RATEWARDEN__*` environment variables.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: WardenConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configured policies against the policy invariants.
    pub fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(WardenError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(WardenError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.monitor.interval_secs == 0 {
            return Err(WardenError::Config(
                "monitor.interval_secs must be greater than zero".to_string(),
            ));
        }

        PolicyRegistry::with_overrides(&self.policies).map(|_| ())
    }
}
