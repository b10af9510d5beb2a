//! Translation of admission decisions into HTTP-shaped responses.
//!
//! Nothing here touches the limiter state; the same decision and instant
//! always produce the same response.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ratelimit::{Decision, Policy};

/// Status code for a denied request.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Policy capacity per window.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Requests left in the current window.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Unix seconds at which the window (or block) ends.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Whole seconds to wait, only set on denials.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Headers and optional rejection for one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResponse {
    /// `Some(429)` when denied; `None` lets the request through untouched
    pub status: Option<u16>,
    /// Header name/value pairs to attach to the response
    pub headers: Vec<(&'static str, String)>,
    /// JSON body for the rejection
    pub body: Option<DenialBody>,
}

/// Body of a 429 response.
///
/// Carries no counters and no hint of the store in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    /// Fixed error label, `"Too Many Requests"`
    pub error: String,
    /// Human-readable hint naming the wait
    pub message: String,
    /// Seconds until the client may retry
    pub retry_after: u64,
}

impl AdmissionResponse {
    /// Build the response for `decision` taken under `policy`, as seen at `now`.
    pub fn from_decision(decision: &Decision, policy: &Policy, now: DateTime<Utc>) -> Self {
        let mut headers = vec![
            (HEADER_LIMIT, policy.capacity().to_string()),
            (HEADER_REMAINING, decision.remaining.to_string()),
            (HEADER_RESET, decision.reset_at.timestamp().to_string()),
        ];

        if decision.allowed {
            return Self {
                status: None,
                headers,
                body: None,
            };
        }

        let retry = retry_after(decision, now);
        headers.push((HEADER_RETRY_AFTER, retry.to_string()));

        Self {
            status: Some(TOO_MANY_REQUESTS),
            headers,
            body: Some(DenialBody {
                error: "Too Many Requests".to_string(),
                message: denial_message(retry),
                retry_after: retry,
            }),
        }
    }

    /// Whether the request must be rejected.
    pub fn is_rejected(&self) -> bool {
        self.status.is_some()
    }

    /// Value of a header by name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Rejection body rendered as JSON.
    pub fn body_json(&self) -> Option<String> {
        self.body
            .as_ref()
            .and_then(|body| serde_json::to_string(body).ok())
    }
}

/// Whole seconds until a denied client may retry, rounded up, never negative.
pub fn retry_after(decision: &Decision, now: DateTime<Utc>) -> u64 {
    let until = decision.blocked_until.unwrap_or(decision.reset_at);
    let millis = (until - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis as u64).div_ceil(1000)
}

fn denial_message(retry: u64) -> String {
    match retry {
        0 => "Too many requests. Please try again.".to_string(),
        s if s < 120 => format!("Too many requests. Please try again in {} seconds.", s),
        s => format!(
            "Too many requests. Please try again in {} minutes.",
            s.div_ceil(60)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{PolicyName, PolicyRegistry};
    use chrono::TimeDelta;

    fn auth() -> Policy {
        PolicyRegistry::builtin()
            .get(&PolicyName::Auth)
            .unwrap()
            .clone()
    }

    #[test]
    fn test_allowed_passes_through() {
        let now = Utc::now();
        let decision = Decision::allowed(3, now + TimeDelta::seconds(42));
        let response = AdmissionResponse::from_decision(&decision, &auth(), now);

        assert!(!response.is_rejected());
        assert!(response.body.is_none());
        assert_eq!(response.header("x-ratelimit-limit"), Some("5"));
        assert_eq!(response.header(HEADER_REMAINING), Some("3"));
        assert_eq!(
            response.header(HEADER_RESET),
            Some(decision.reset_at.timestamp().to_string().as_str())
        );
        assert!(response.header(HEADER_RETRY_AFTER).is_none());
    }

    #[test]
    fn test_denied_is_429_with_retry_after() {
        let now = Utc::now();
        let decision = Decision::blocked(now + TimeDelta::seconds(600));
        let response = AdmissionResponse::from_decision(&decision, &auth(), now);

        assert_eq!(response.status, Some(TOO_MANY_REQUESTS));
        assert_eq!(response.header(HEADER_RETRY_AFTER), Some("600"));
        assert_eq!(response.header(HEADER_REMAINING), Some("0"));

        let body = response.body.unwrap();
        assert_eq!(body.retry_after, 600);
        assert!(body.message.contains("10 minutes"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let decision = Decision::blocked(now + TimeDelta::milliseconds(1_001));
        assert_eq!(retry_after(&decision, now), 2);
    }

    #[test]
    fn test_retry_after_never_negative() {
        let now = Utc::now();
        let decision = Decision::blocked(now - TimeDelta::seconds(5));
        assert_eq!(retry_after(&decision, now), 0);
    }

    #[test]
    fn test_body_json_shape() {
        let now = Utc::now();
        let decision = Decision::blocked(now + TimeDelta::seconds(30));
        let response = AdmissionResponse::from_decision(&decision, &auth(), now);

        let json: serde_json::Value = serde_json::from_str(&response.body_json().unwrap()).unwrap();
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["retryAfter"], 30);
        assert!(json.get("remaining").is_none());
        assert!(json.get("backend").is_none());
    }
}
