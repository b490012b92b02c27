//! Transport boundary.
//!
//! The coordinator never owns sockets. It asks the transport to subscribe
//! streams, queries which connection serves an entity, and reports
//! connections that hit a permanent subscription limit.

pub mod sim;

use async_trait::async_trait;

use crate::common::{ConnectionIndex, ConnectionLock, TransportResult};

pub use sim::{SimOutcome, SimulatedTransport, SubscribeCall};

/// Client side of the remote streaming service.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribe one stream. May take arbitrarily long.
    async fn subscribe(&self, entity_id: &str, instance_index: u32) -> TransportResult<()>;

    /// Connection currently serving `entity_id`, if any.
    fn connection_binding_of(&self, entity_id: &str) -> Option<ConnectionIndex>;

    /// Whether the connection is currently up.
    fn is_connected(&self, connection: ConnectionIndex) -> bool;

    /// Drop the entity's connection binding.
    fn unbind(&self, entity_id: &str);

    /// Stop placing subscriptions on a connection that hit a permanent limit.
    fn lock_connection(&self, connection: ConnectionIndex, lock: ConnectionLock);
}
