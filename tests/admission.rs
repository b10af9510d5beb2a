//! End-to-end admission scenarios through the public API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use ratewarden::error::StoreError;
use ratewarden::ratelimit::store::{MemoryWindowStore, StoreResult, WindowCount};
use ratewarden::ratelimit::{
    Backend, ClientRequest, Clock, MockClock, PolicyName, RateLimiter, WindowKey, WindowStore,
};
use ratewarden::response::{AdmissionResponse, HEADER_RETRY_AFTER};

fn limiter_at(clock: &MockClock) -> RateLimiter {
    RateLimiter::builder().clock(Arc::new(clock.clone())).build()
}

/// A distributed store whose every call times out.
struct DownStore;

impl DownStore {
    fn timeout(operation: &'static str) -> StoreError {
        StoreError::Timeout {
            operation,
            after: Duration::from_millis(250),
        }
    }
}

#[async_trait]
impl WindowStore for DownStore {
    fn backend(&self) -> Backend {
        Backend::Redis
    }

    async fn increment(&self, _key: &WindowKey, _window: Duration) -> StoreResult<WindowCount> {
        Err(Self::timeout("increment"))
    }

    async fn get_block(&self, _key: &WindowKey) -> StoreResult<Option<DateTime<Utc>>> {
        Err(Self::timeout("get_block"))
    }

    async fn set_block(&self, _key: &WindowKey, _until: DateTime<Utc>) -> StoreResult<()> {
        Err(Self::timeout("set_block"))
    }

    async fn reset(&self, _key: &WindowKey) -> StoreResult<()> {
        Err(Self::timeout("reset"))
    }

    async fn whitelisted_until(&self, _identifier: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Err(Self::timeout("whitelisted_until"))
    }

    async fn set_whitelist(&self, _identifier: &str, _until: DateTime<Utc>) -> StoreResult<()> {
        Err(Self::timeout("set_whitelist"))
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(Self::timeout("ping"))
    }
}

#[tokio::test]
async fn auth_burst_from_one_address() {
    let clock = MockClock::starting_now();
    let limiter = limiter_at(&clock);

    let request = ClientRequest::from_headers(
        "POST",
        [("X-Forwarded-For", "203.0.113.7, 10.0.0.1")],
        None,
    );
    let identifier = request.resolve();
    assert_eq!(identifier, "ip:203.0.113.7");

    let auth = limiter.registry().get(&PolicyName::Auth).unwrap().clone();

    for expected in [4, 3, 2, 1, 0] {
        let decision = limiter.check(&identifier, &PolicyName::Auth).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected);
        clock.advance(Duration::from_secs(2));
    }

    let decision = limiter.check(&identifier, &PolicyName::Auth).await.unwrap();
    let response = AdmissionResponse::from_decision(&decision, &auth, clock.now());

    assert_eq!(response.status, Some(429));
    assert_eq!(response.header(HEADER_RETRY_AFTER), Some("600"));
}

#[tokio::test]
async fn slow_general_traffic_is_never_limited() {
    let clock = MockClock::starting_now();
    let limiter = limiter_at(&clock);

    for _ in 0..3 {
        let decision = limiter.check("user:alice", &PolicyName::General).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);
        clock.advance(Duration::from_secs(70));
    }
}

#[tokio::test]
async fn block_lasts_exactly_block_seconds() {
    let clock = MockClock::starting_now();
    let limiter = limiter_at(&clock);
    let policy = PolicyName::Vocabulary;

    for _ in 0..30 {
        assert!(limiter.check("user:bob", &policy).await.unwrap().allowed);
    }
    let violation_at = clock.now();
    let denied = limiter.check("user:bob", &policy).await.unwrap();
    assert_eq!(
        denied.blocked_until.unwrap() - violation_at,
        TimeDelta::seconds(300)
    );

    clock.advance(Duration::from_secs(299));
    assert!(limiter.check("user:bob", &policy).await.unwrap().is_denied());

    clock.advance(Duration::from_secs(1));
    let fresh = limiter.check("user:bob", &policy).await.unwrap();
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 29);
}

#[tokio::test]
async fn reset_restores_full_capacity() {
    let clock = MockClock::starting_now();
    let limiter = limiter_at(&clock);

    for _ in 0..11 {
        limiter.check("ip:198.51.100.2", &PolicyName::Description).await.unwrap();
    }
    limiter.reset("ip:198.51.100.2", &PolicyName::Description).await.unwrap();

    let decision = limiter.check("ip:198.51.100.2", &PolicyName::Description).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 9);
}

#[tokio::test]
async fn unreachable_redis_still_decides() {
    let limiter = RateLimiter::builder()
        .distributed(Arc::new(DownStore))
        .build();

    let decision = limiter.check("user:carol", &PolicyName::General).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 99);

    limiter.reset("user:carol", &PolicyName::General).await.unwrap();
    assert!(limiter.stats().fallbacks > 0);
}

#[tokio::test]
async fn get_block_is_stable_without_writes() {
    let clock = MockClock::starting_now();
    let store = MemoryWindowStore::with_clock(Arc::new(clock.clone()));
    let key = WindowKey::new(&PolicyName::Auth, "ip:192.0.2.1");

    let until = clock.now() + TimeDelta::seconds(600);
    store.set_block(&key, until).await.unwrap();

    let first = store.get_block(&key).await.unwrap();
    let second = store.get_block(&key).await.unwrap();
    assert_eq!(first, Some(until));
    assert_eq!(first, second);
}
