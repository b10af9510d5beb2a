//! The outcome of an admission check.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of [`RateLimiter::check`](super::RateLimiter::check).
///
/// A denial is an ordinary value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests still admissible in the current window
    pub remaining: u64,
    /// When the current window ends, or when a block lifts
    pub reset_at: DateTime<Utc>,
    /// End of the active penalty, present only when denied
    pub blocked_until: Option<DateTime<Utc>>,
    /// Admitted through an administrative whitelist entry
    pub whitelisted: bool,
}

impl Decision {
    /// An admitted request.
    pub fn allowed(remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            blocked_until: None,
            whitelisted: false,
        }
    }

    /// A request admitted without touching any counter.
    pub fn whitelisted(capacity: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            whitelisted: true,
            ..Self::allowed(capacity, reset_at)
        }
    }

    /// A request denied because the client is serving a penalty.
    pub fn blocked(blocked_until: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at: blocked_until,
            blocked_until: Some(blocked_until),
            whitelisted: false,
        }
    }

    /// Whether the request was denied.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let now = Utc::now();

        let allowed = Decision::allowed(4, now);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 4);
        assert!(allowed.blocked_until.is_none());

        let blocked = Decision::blocked(now);
        assert!(blocked.is_denied());
        assert_eq!(blocked.remaining, 0);
        assert_eq!(blocked.blocked_until, Some(now));

        let whitelisted = Decision::whitelisted(100, now);
        assert!(whitelisted.allowed && whitelisted.whitelisted);
        assert_eq!(whitelisted.remaining, 100);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(Decision::allowed(1, Utc::now())).unwrap();
        assert!(json.get("resetAt").is_some());
        assert!(json.get("blockedUntil").is_some());
    }
}
