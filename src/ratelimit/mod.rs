//! Rate limiting logic and state management.

pub mod clock;
mod decision;
mod escalation;
mod identity;
mod key;
mod limiter;
mod policy;
pub mod store;

pub use clock::{Clock, MockClock, SystemClock};
pub use decision::Decision;
pub use escalation::{EscalationTracker, ViolationRecord, DEFAULT_DECAY_FACTOR, DEFAULT_MAX_BACKOFF};
pub use identity::{ClientRequest, ClientRequestBuilder};
pub use key::WindowKey;
pub use limiter::{LimiterStats, RateLimiter, RateLimiterBuilder, StoreHealth};
pub use policy::{Policy, PolicyConfig, PolicyName, PolicyRegistry};
pub use store::{Backend, WindowStore};
