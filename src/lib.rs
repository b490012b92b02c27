//! Subkeeper - keeps streaming subscriptions alive.
//!
//! Runs one cancellable retry loop per (entity, instance) subscription key
//! against a shared transport, with exponential backoff, rate-limit
//! handling and resubscribe logic for timeouts, disconnects and reconnects.

pub mod common;
pub mod config;
pub mod coordinator;
pub mod transport;

pub use common::{
    ConnectionIndex, ConnectionLock, RateLimitReason, SubscriptionKey, TransportError,
};
pub use coordinator::{Coordinator, RetryStatus};
pub use transport::{SimulatedTransport, Transport};
