//! Window key generation.

use super::policy::PolicyName;

/// Prefix shared by every window key.
pub const KEY_PREFIX: &str = "ratelimit";

/// A key that identifies one (policy, client) window.
///
/// Rendered as `ratelimit:{policy}:{identifier}`; the penalty timestamp
/// lives next to it under the `:block` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The policy this window belongs to
    pub policy: PolicyName,
    /// Resolved client identifier
    pub identifier: String,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(policy: &PolicyName, identifier: &str) -> Self {
        Self {
            policy: policy.clone(),
            identifier: identifier.to_string(),
        }
    }

    /// Key of the request counter.
    pub fn counter_key(&self) -> String {
        format!("{}:{}:{}", KEY_PREFIX, self.policy, self.identifier)
    }

    /// Key of the standalone block timestamp.
    pub fn block_key(&self) -> String {
        format!("{}:block", self.counter_key())
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.counter_key())
    }
}

/// Key of a whitelist entry for a client identifier.
///
/// Kept outside the `ratelimit:` namespace so it can never collide with a
/// policy window.
pub fn whitelist_key(identifier: &str) -> String {
    format!("{}-whitelist:{}", KEY_PREFIX, identifier)
}
