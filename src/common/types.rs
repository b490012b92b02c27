//! Shared types used across the coordinator.

use std::fmt;

use crate::common::error::RateLimitReason;

/// Index of a transport connection (socket) serving a set of entities.
pub type ConnectionIndex = usize;

/// Identifies one retryable subscription stream: an entity plus an
/// instance index for entities with several concurrent streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub entity_id: String,
    pub instance_index: u32,
}

impl SubscriptionKey {
    pub fn new(entity_id: impl Into<String>, instance_index: u32) -> Self {
        Self {
            entity_id: entity_id.into(),
            instance_index,
        }
    }

    /// Key for the entity's default instance.
    pub fn primary(entity_id: impl Into<String>) -> Self {
        Self::new(entity_id, 0)
    }

    /// True if this key belongs to exactly `entity_id` (no prefix matching).
    pub fn belongs_to(&self, entity_id: &str) -> bool {
        self.entity_id == entity_id
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.instance_index)
    }
}

/// Metadata handed to the transport when a connection is locked because it
/// hit a permanent subscription limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLock {
    /// The limit that was hit.
    pub reason: RateLimitReason,
    /// Entity whose subscribe attempt hit the limit.
    pub entity_id: String,
    /// Instance index of that attempt.
    pub instance_index: u32,
}
