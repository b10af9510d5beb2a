//! Rate limit policies and the registry that maps names to them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WardenError};

/// Name of a rate limit policy.
///
/// The built-in policies are variants; anything defined only through
/// configuration lands in [`PolicyName::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyName {
    /// Sign-in and sign-up endpoints
    Auth,
    /// Catch-all for ordinary API endpoints
    General,
    /// Image description generation
    Description,
    /// Vocabulary generation
    Vocabulary,
    /// A policy defined in configuration
    Custom(String),
}

impl PolicyName {
    /// All built-in policy names.
    pub const BUILTIN: [PolicyName; 4] = [
        PolicyName::Auth,
        PolicyName::General,
        PolicyName::Description,
        PolicyName::Vocabulary,
    ];

    /// String form used in keys and logs.
    pub fn as_str(&self) -> &str {
        match self {
            PolicyName::Auth => "auth",
            PolicyName::General => "general",
            PolicyName::Description => "description",
            PolicyName::Vocabulary => "vocabulary",
            PolicyName::Custom(name) => name,
        }
    }

    /// Default parameters for built-in policies.
    fn builtin_policy(&self) -> Option<Policy> {
        let (capacity, window, block, escalating) = match self {
            PolicyName::Auth => (5, 60, 600, true),
            PolicyName::General => (100, 60, 180, false),
            PolicyName::Description => (10, 60, 300, false),
            PolicyName::Vocabulary => (30, 60, 300, false),
            PolicyName::Custom(_) => return None,
        };

        Some(Policy {
            name: self.clone(),
            capacity,
            window: Duration::from_secs(window),
            block: Duration::from_secs(block),
            escalating,
        })
    }
}

impl From<String> for PolicyName {
    fn from(name: String) -> Self {
        match name.as_str() {
            "auth" => PolicyName::Auth,
            "general" => PolicyName::General,
            "description" => PolicyName::Description,
            "vocabulary" => PolicyName::Vocabulary,
            _ => PolicyName::Custom(name),
        }
    }
}

impl From<&str> for PolicyName {
    fn from(name: &str) -> Self {
        PolicyName::from(name.to_string())
    }
}

impl From<PolicyName> for String {
    fn from(name: PolicyName) -> Self {
        name.as_str().to_string()
    }
}

impl FromStr for PolicyName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(PolicyName::from(s))
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: PolicyName,
    capacity: u64,
    window: Duration,
    block: Duration,
    escalating: bool,
}

impl Policy {
    /// Create a policy, checking that it can actually punish a violator.
    ///
    /// Requires `capacity >= 1`, a window of at least one second, and a
    /// block at least as long as the window.
    pub fn new(
        name: PolicyName,
        capacity: u64,
        window: Duration,
        block: Duration,
        escalating: bool,
    ) -> Result<Self> {
        let invalid = |reason: &str| WardenError::InvalidPolicy {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.as_str().is_empty() || name.as_str().contains(':') {
            return Err(invalid("name must be non-empty and must not contain ':'"));
        }
        if capacity < 1 {
            return Err(invalid("capacity must be at least 1"));
        }
        if window < Duration::from_secs(1) {
            return Err(invalid("window must be at least one second"));
        }
        if block < window {
            return Err(invalid("block must be at least as long as the window"));
        }

        Ok(Self {
            name,
            capacity,
            window,
            block,
            escalating,
        })
    }

    /// The policy's name.
    pub fn name(&self) -> &PolicyName {
        &self.name
    }

    /// Maximum admitted requests per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// How long a violator is denied.
    pub fn block(&self) -> Duration {
        self.block
    }

    /// Whether repeated violations lengthen the block.
    pub fn escalating(&self) -> bool {
        self.escalating
    }
}

/// Policy entry as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name; a built-in name overrides that policy
    pub name: String,
    /// Maximum admitted requests per window
    pub capacity: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Block length in seconds
    pub block_secs: u64,
    /// Apply exponential backoff to repeat violators
    #[serde(default)]
    pub escalating: bool,
}

impl PolicyConfig {
    /// Validate into a [`Policy`].
    pub fn to_policy(&self) -> Result<Policy> {
        Policy::new(
            PolicyName::from(self.name.as_str()),
            self.capacity,
            Duration::from_secs(self.window_secs),
            Duration::from_secs(self.block_secs),
            self.escalating,
        )
    }
}

/// Read-only table of policies, fixed at startup.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<PolicyName, Policy>,
}

impl PolicyRegistry {
    /// Registry containing only the built-in policies.
    pub fn builtin() -> Self {
        let policies = PolicyName::BUILTIN
            .iter()
            .filter_map(|name| name.builtin_policy())
            .map(|policy| (policy.name.clone(), policy))
            .collect();

        Self { policies }
    }

    /// Built-ins, overridden or extended by configured entries.
    pub fn with_overrides(entries: &[PolicyConfig]) -> Result<Self> {
        let mut registry = Self::builtin();

        for entry in entries {
            let policy = entry.to_policy()?;
            info!(
                policy = %policy.name,
                capacity = policy.capacity,
                window_secs = policy.window.as_secs(),
                block_secs = policy.block.as_secs(),
                "Registering configured policy"
            );
            registry.policies.insert(policy.name.clone(), policy);
        }

        Ok(registry)
    }

    /// Look up a policy. An unknown name is a programming error.
    pub fn get(&self, name: &PolicyName) -> Result<&Policy> {
        self.policies
            .get(name)
            .ok_or_else(|| WardenError::UnknownPolicy(name.to_string()))
    }

    /// All registered policies, sorted by name.
    pub fn policies(&self) -> Vec<&Policy> {
        let mut policies: Vec<&Policy> = self.policies.values().collect();
        policies.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        policies
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let registry = PolicyRegistry::builtin();

        let auth = registry.get(&PolicyName::Auth).unwrap();
        assert_eq!(auth.capacity(), 5);
        assert_eq!(auth.window(), Duration::from_secs(60));
        assert_eq!(auth.block(), Duration::from_secs(600));
        assert!(auth.escalating());

        let general = registry.get(&PolicyName::General).unwrap();
        assert_eq!(general.capacity(), 100);
        assert_eq!(general.block(), Duration::from_secs(180));
        assert!(!general.escalating());

        assert_eq!(registry.get(&PolicyName::Description).unwrap().capacity(), 10);
        assert_eq!(registry.get(&PolicyName::Vocabulary).unwrap().capacity(), 30);
        assert_eq!(registry.policies().len(), 4);
    }

    #[test]
    fn test_name_parsing() {
        assert_eq!("auth".parse::<PolicyName>().unwrap(), PolicyName::Auth);
        assert_eq!(PolicyName::from("general"), PolicyName::General);
        assert_eq!(
            PolicyName::from("uploads"),
            PolicyName::Custom("uploads".to_string())
        );
        assert_eq!(PolicyName::Vocabulary.to_string(), "vocabulary");
    }

    #[test]
    fn test_unknown_policy_is_error() {
        let registry = PolicyRegistry::builtin();
        let err = registry.get(&PolicyName::from("uploads")).unwrap_err();
        assert!(matches!(err, WardenError::UnknownPolicy(name) if name == "uploads"));
    }

    #[test]
    fn test_invariants_enforced() {
        let window = Duration::from_secs(60);
        assert!(Policy::new(PolicyName::General, 0, window, window, false).is_err());
        assert!(Policy::new(PolicyName::General, 1, Duration::ZERO, window, false).is_err());
        assert!(Policy::new(PolicyName::General, 1, window, Duration::from_secs(59), false).is_err());
        assert!(Policy::new(PolicyName::from("a:b"), 1, window, window, false).is_err());
        assert!(Policy::new(PolicyName::General, 1, window, window, false).is_ok());
    }

    #[test]
    fn test_overrides_and_custom_entries() {
        let entries = vec![
            PolicyConfig {
                name: "general".to_string(),
                capacity: 50,
                window_secs: 30,
                block_secs: 60,
                escalating: false,
            },
            PolicyConfig {
                name: "uploads".to_string(),
                capacity: 3,
                window_secs: 60,
                block_secs: 120,
                escalating: true,
            },
        ];

        let registry = PolicyRegistry::with_overrides(&entries).unwrap();
        assert_eq!(registry.get(&PolicyName::General).unwrap().capacity(), 50);
        let uploads = registry.get(&PolicyName::from("uploads")).unwrap();
        assert_eq!(uploads.capacity(), 3);
        assert!(uploads.escalating());
        assert_eq!(registry.policies().len(), 5);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let entries = vec![PolicyConfig {
            name: "auth".to_string(),
            capacity: 5,
            window_secs: 600,
            block_secs: 60,
            escalating: true,
        }];

        let err = PolicyRegistry::with_overrides(&entries).unwrap_err();
        assert!(matches!(err, WardenError::InvalidPolicy { .. }));
    }
}
