//! Lifecycle handlers.
//!
//! Translate transport signals into subscribe and cancel calls:
//! - timeout: resubscribe right away if the entity's connection is up
//! - disconnect: resubscribe after a jittered delay if still bound
//! - reconnect: cancel loops on the replaced connection, wait for them to
//!   drain, then resubscribe each reconnected entity once

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::common::{ConnectionIndex, CoordinatorError, SubscriptionKey};

/// Uniform random delay in `[min_ms, max_ms]`.
fn jitter(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

impl Coordinator {
    /// A subscribe request timed out. Retry if the entity's connection is up.
    pub fn on_timeout(&self, entity_id: &str, instance_index: u32) -> bool {
        let transport = &self.inner.transport;
        match transport.connection_binding_of(entity_id) {
            Some(connection) if transport.is_connected(connection) => {
                self.subscribe(SubscriptionKey::new(entity_id, instance_index), false)
            }
            Some(connection) => {
                debug!(
                    entity = entity_id,
                    connection, "Subscribe timed out on a disconnected connection, ignoring"
                );
                false
            }
            None => {
                debug!(entity = entity_id, "Subscribe timed out for unbound entity, ignoring");
                false
            }
        }
    }

    /// The stream was dropped by a disconnect.
    ///
    /// Waits a random 1-5s so that mass disconnects don't resubscribe in
    /// lockstep, then retries in disconnected mode if the entity is still bound.
    pub fn on_disconnected(&self, entity_id: &str, instance_index: u32) -> JoinHandle<()> {
        let config = &self.inner.config;
        let delay = jitter(
            config.disconnect_jitter_min_ms,
            config.disconnect_jitter_max_ms,
        );
        let key = SubscriptionKey::new(entity_id, instance_index);
        let coordinator = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if coordinator
                .inner
                .transport
                .connection_binding_of(&key.entity_id)
                .is_none()
            {
                debug!(key = %key, "Entity unbound after disconnect, not resubscribing");
                return;
            }
            coordinator.subscribe(key, true);
        })
    }

    /// A connection was replaced.
    ///
    /// Loops targeting the old connection are cancelled. Every entity in
    /// `entity_ids` that is not already being resubscribed gets its own task,
    /// which waits until no loop remains for the entity and then subscribes
    /// its default instance. One entity's failure never affects another's.
    pub fn on_reconnected(
        &self,
        connection: ConnectionIndex,
        entity_ids: &[String],
    ) -> Vec<JoinHandle<()>> {
        let transport = &self.inner.transport;
        let registry = &self.inner.registry;

        let stale: Vec<SubscriptionKey> = registry
            .keys()
            .into_iter()
            .filter(|key| transport.connection_binding_of(&key.entity_id) == Some(connection))
            .collect();
        for key in &stale {
            self.cancel(key);
        }
        info!(
            connection,
            cancelled = stale.len(),
            entities = entity_ids.len(),
            "Connection reconnected"
        );

        let mut tasks = Vec::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            if !registry.mark_resubscribing(entity_id) {
                debug!(entity = %entity_id, "Resubscribe already pending, skipping");
                continue;
            }

            let coordinator = self.clone();
            let entity_id = entity_id.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = coordinator.resubscribe_after_drain(&entity_id).await {
                    warn!(entity = %entity_id, "Reconnect resubscribe abandoned: {}", e);
                }
            }));
        }
        tasks
    }

    /// The entity stays in the dedup set until its subscribe has been issued,
    /// so repeated reconnect signals during the drain or the jitter are absorbed.
    async fn resubscribe_after_drain(&self, entity_id: &str) -> Result<(), CoordinatorError> {
        let registry = &self.inner.registry;
        if let Err(e) = self.wait_for_drain(entity_id).await {
            registry.clear_resubscribing(entity_id);
            return Err(e);
        }

        let config = &self.inner.config;
        let delay = jitter(config.reconnect_jitter_min_ms, config.reconnect_jitter_max_ms);
        tokio::time::sleep(delay).await;

        self.subscribe(SubscriptionKey::primary(entity_id), false);
        registry.clear_resubscribing(entity_id);
        Ok(())
    }

    /// Poll until no retry loop remains for any instance of the entity.
    async fn wait_for_drain(&self, entity_id: &str) -> Result<(), CoordinatorError> {
        let config = &self.inner.config;
        let registry = &self.inner.registry;
        let polls = ConstantBuilder::default()
            .with_delay(config.drain_poll_interval())
            .with_max_times(config.drain_max_polls.unwrap_or(usize::MAX));

        (move || async move {
            if registry.has_entity(entity_id) {
                Err(CoordinatorError::StillDraining {
                    entity_id: entity_id.to_string(),
                })
            } else {
                Ok(())
            }
        })
        .retry(polls)
        .sleep(tokio::time::sleep)
        .notify(|_, delay| {
            debug!(
                entity = entity_id,
                "Waiting {:?} for stale retry loop to drain", delay
            );
        })
        .await
    }
}
