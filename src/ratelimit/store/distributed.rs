//! Redis-backed window store.
//!
//! Counters use an atomic `INCR` with a millisecond TTL set when a window
//! starts, so every process sharing the Redis instance sees one total order
//! of admissions per key. Block and whitelist timestamps are stored as epoch
//! milliseconds under their own keys and expire on their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tracing::{debug, info};

use super::{Backend, StoreResult, WindowCount, WindowStore};
use crate::error::StoreError;
use crate::ratelimit::clock::{offset, until, Clock, SystemClock};
use crate::ratelimit::key::{whitelist_key, WindowKey};

/// Increments the counter, starting the TTL on the first hit of a window.
///
/// Returns `{count, remaining_ttl_ms}`. A counter that somehow lost its TTL
/// gets one again so it cannot live forever.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// Upper bound on a single command, after which the call fails fast
    pub command_timeout: Duration,
    /// Upper bound on establishing the initial connection
    pub connect_timeout: Duration,
}

impl RedisStoreConfig {
    /// Configuration with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            command_timeout: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Window store shared by every process connected to the same Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    increment: Arc<Script>,
    command_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Connect to Redis using the system clock.
    pub async fn connect(config: &RedisStoreConfig) -> StoreResult<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Connect to Redis, reading time from `clock`.
    pub async fn connect_with_clock(
        config: &RedisStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| StoreError::Connection {
            backend: "redis",
            message: e.to_string(),
        })?;

        let connection = match tokio::time::timeout(
            config.connect_timeout,
            ConnectionManager::new(client),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(StoreError::Connection {
                    backend: "redis",
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(StoreError::Timeout {
                    operation: "connect",
                    after: config.connect_timeout,
                })
            }
        };

        let store = Self {
            connection,
            increment: Arc::new(Script::new(INCREMENT_SCRIPT)),
            command_timeout: config.command_timeout,
            clock,
        };
        store.ping().await?;

        info!(command_timeout = ?config.command_timeout, "Connected to Redis window store");
        Ok(store)
    }

    /// Run one Redis call under the command timeout.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(StoreError::Command { operation, source }),
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.command_timeout,
            }),
        }
    }

    /// Store an epoch-millisecond timestamp under `key`, expiring at that instant.
    async fn put_deadline(
        &self,
        operation: &'static str,
        key: String,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ttl_ms = ttl_millis(until(self.clock.now(), at));
        let mut conn = self.connection.clone();
        self.bounded(operation, async move {
            conn.pset_ex(key, at.timestamp_millis(), ttl_ms).await
        })
        .await
    }

    /// Read a timestamp written by [`put_deadline`](Self::put_deadline).
    async fn get_deadline(
        &self,
        operation: &'static str,
        key: String,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut conn = self.connection.clone();
        let millis: Option<i64> = self
            .bounded(operation, async move { conn.get(key).await })
            .await?;

        let now = self.clock.now();
        Ok(millis
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .filter(|at| *at > now))
    }
}

/// Redis rejects a zero TTL; anything already due expires after 1ms.
fn ttl_millis(remaining: Duration) -> u64 {
    u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    fn backend(&self) -> Backend {
        Backend::Redis
    }

    async fn increment(&self, key: &WindowKey, window: Duration) -> StoreResult<WindowCount> {
        let counter_key = key.counter_key();
        let window_ms = ttl_millis(window);
        let mut conn = self.connection.clone();
        let script = self.increment.clone();

        let (count, ttl_ms): (u64, i64) = self
            .bounded("increment", async move {
                script
                    .key(counter_key)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let remaining = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(window_ms));
        let reset_at = offset(self.clock.now(), remaining);

        if count == 1 {
            debug!(key = %key, reset_at = %reset_at, "Started new Redis window");
        }

        Ok(WindowCount { count, reset_at })
    }

    async fn get_block(&self, key: &WindowKey) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_deadline("get_block", key.block_key()).await
    }

    async fn set_block(&self, key: &WindowKey, until: DateTime<Utc>) -> StoreResult<()> {
        self.put_deadline("set_block", key.block_key(), until).await
    }

    async fn reset(&self, key: &WindowKey) -> StoreResult<()> {
        let keys = vec![key.counter_key(), key.block_key()];
        let mut conn = self.connection.clone();
        let removed: u64 = self
            .bounded("reset", async move { conn.del(keys).await })
            .await?;

        debug!(key = %key, removed, "Reset Redis window");
        Ok(())
    }

    async fn whitelisted_until(&self, identifier: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_deadline("whitelisted_until", whitelist_key(identifier))
            .await
    }

    async fn set_whitelist(&self, identifier: &str, until: DateTime<Utc>) -> StoreResult<()> {
        self.put_deadline("set_whitelist", whitelist_key(identifier), until)
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _pong: String = self
            .bounded("ping", async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }

    #[test]
    fn test_default_timeouts() {
        let config = RedisStoreConfig::new("redis://127.0.0.1:6379");
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let config = RedisStoreConfig::new("not a url");
        let err = RedisWindowStore::connect(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection { backend: "redis", .. }));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_fast() {
        let mut config = RedisStoreConfig::new("redis://127.0.0.1:1");
        config.connect_timeout = Duration::from_millis(500);

        let started = std::time::Instant::now();
        let result = RedisWindowStore::connect(&config).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
