//! Common utilities and types shared across the crate.

pub mod backoff;
pub mod error;
pub mod types;

pub use backoff::{Backoff, BackoffConfig};
pub use error::{ConfigError, CoordinatorError, RateLimitReason, TransportError, TransportResult};
pub use types::{ConnectionIndex, ConnectionLock, SubscriptionKey};
