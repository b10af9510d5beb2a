//! Integration tests for the Redis window store.
//!
//! These tests require a Redis instance running at `redis://127.0.0.1/`.
//! Tests are ignored by default - run with `cargo test --test redis_store -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use ratewarden::ratelimit::store::{RedisStoreConfig, RedisWindowStore};
use ratewarden::ratelimit::{Backend, PolicyName, RateLimiter, WindowKey, WindowStore};

const REDIS_URL: &str = "redis://127.0.0.1/";

/// Check if Redis is available before running tests
async fn redis_available() -> bool {
    RedisWindowStore::connect(&RedisStoreConfig::new(REDIS_URL))
        .await
        .is_ok()
}

async fn connect() -> RedisWindowStore {
    RedisWindowStore::connect(&RedisStoreConfig::new(REDIS_URL))
        .await
        .expect("Failed to connect to Redis")
}

/// A key no other test run can collide with.
fn unique_key(policy: &PolicyName, test_name: &str) -> (WindowKey, String) {
    let identifier = format!("test:{}:{}", test_name, uuid::Uuid::new_v4());
    (WindowKey::new(policy, &identifier), identifier)
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_increment_counts_within_window() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available at redis://127.0.0.1/");
        return;
    }

    let store = connect().await;
    let (key, _) = unique_key(&PolicyName::General, "increment");
    let window = Duration::from_secs(60);

    let before = Utc::now();
    let first = store.increment(&key, window).await.unwrap();
    let second = store.increment(&key, window).await.unwrap();

    assert_eq!(first.count, 1);
    assert_eq!(second.count, 2);
    assert!(first.reset_at > before);
    assert!(first.reset_at <= Utc::now() + TimeDelta::seconds(60));
    // Both answers come from the same TTL.
    assert!((second.reset_at - first.reset_at).num_milliseconds().abs() < 1000);

    store.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_window_rolls_over() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = connect().await;
    let (key, _) = unique_key(&PolicyName::General, "rollover");
    let window = Duration::from_secs(1);

    store.increment(&key, window).await.unwrap();
    store.increment(&key, window).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let fresh = store.increment(&key, window).await.unwrap();
    assert_eq!(fresh.count, 1);

    store.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_block_is_stable_and_expires() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = connect().await;
    let (key, _) = unique_key(&PolicyName::Auth, "block");

    assert_eq!(store.get_block(&key).await.unwrap(), None);

    let until = Utc::now() + TimeDelta::milliseconds(500);
    store.set_block(&key, until).await.unwrap();

    // Stored at millisecond precision; reading twice gives the same answer.
    let first = store.get_block(&key).await.unwrap();
    let second = store.get_block(&key).await.unwrap();
    assert_eq!(first.map(|at| at.timestamp_millis()), Some(until.timestamp_millis()));
    assert_eq!(first, second);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.get_block(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_reset_clears_counter_and_block() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = connect().await;
    let (key, _) = unique_key(&PolicyName::Auth, "reset");
    let window = Duration::from_secs(60);

    for _ in 0..3 {
        store.increment(&key, window).await.unwrap();
    }
    store
        .set_block(&key, Utc::now() + TimeDelta::seconds(600))
        .await
        .unwrap();

    store.reset(&key).await.unwrap();
    assert_eq!(store.get_block(&key).await.unwrap(), None);
    assert_eq!(store.increment(&key, window).await.unwrap().count, 1);

    store.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_whitelist_expires() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = connect().await;
    let (_, identifier) = unique_key(&PolicyName::General, "whitelist");

    assert_eq!(store.whitelisted_until(&identifier).await.unwrap(), None);

    let until = Utc::now() + TimeDelta::milliseconds(500);
    store.set_whitelist(&identifier, until).await.unwrap();
    let stored = store.whitelisted_until(&identifier).await.unwrap();
    assert_eq!(stored.map(|at| at.timestamp_millis()), Some(until.timestamp_millis()));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.whitelisted_until(&identifier).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_connections_share_counters() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    // Two connections stand in for two serving processes.
    let first = connect().await;
    let second = connect().await;
    let (key, _) = unique_key(&PolicyName::General, "shared");
    let window = Duration::from_secs(60);

    first.increment(&key, window).await.unwrap();
    first.increment(&key, window).await.unwrap();
    assert_eq!(second.increment(&key, window).await.unwrap().count, 3);

    let until = Utc::now() + TimeDelta::seconds(60);
    first.set_block(&key, until).await.unwrap();
    assert!(second.get_block(&key).await.unwrap().is_some());

    first.reset(&key).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_backed_limiter_blocks_after_capacity() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let limiter = RateLimiter::builder()
        .distributed(Arc::new(connect().await))
        .build();
    let (_, identifier) = unique_key(&PolicyName::Auth, "limiter");

    for expected in (0..5).rev() {
        let decision = limiter.check(&identifier, &PolicyName::Auth).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected);
    }

    let denied = limiter.check(&identifier, &PolicyName::Auth).await.unwrap();
    let blocked_until = denied.blocked_until.unwrap();
    let penalty = blocked_until - Utc::now();
    assert!(penalty > TimeDelta::seconds(590) && penalty <= TimeDelta::seconds(600));

    let again = limiter.check(&identifier, &PolicyName::Auth).await.unwrap();
    assert!(again.is_denied());
    assert_eq!(
        again.blocked_until.map(|at| at.timestamp_millis()),
        Some(blocked_until.timestamp_millis())
    );

    let stats = limiter.stats();
    assert_eq!(stats.backend, Backend::Redis);
    assert_eq!(stats.fallbacks, 0);
    assert_eq!(stats.violations, 1);

    limiter.reset(&identifier, &PolicyName::Auth).await.unwrap();
    let fresh = limiter.check(&identifier, &PolicyName::Auth).await.unwrap();
    assert_eq!(fresh.remaining, 4);

    limiter.reset(&identifier, &PolicyName::Auth).await.unwrap();
}
