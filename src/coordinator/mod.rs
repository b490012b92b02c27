//! Subscription coordinator.
//!
//! Owns one retry loop per subscription key and translates transport
//! lifecycle signals into subscribe and cancel calls.
//!
//! ## Module Structure
//!
//! - `registry`: Key -> retry control state, plus the resubscribe-dedup set
//! - `retry`: The per-key retry loop
//! - `lifecycle`: Timeout, disconnect and reconnect handlers

pub mod lifecycle;
pub mod registry;
pub mod retry;

use std::sync::Arc;

use tracing::{debug, info};

use crate::common::SubscriptionKey;
use crate::config::CoordinatorConfig;
use crate::transport::Transport;

pub use registry::{RetryRegistry, RetryState, RetryStatus};

struct Inner {
    transport: Arc<dyn Transport>,
    registry: RetryRegistry,
    config: CoordinatorConfig,
}

/// Handle to the coordinator. Cheap to clone; all clones share one registry.
///
/// Methods that start work spawn tokio tasks and must be called from within
/// a tokio runtime.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                registry: RetryRegistry::new(),
                config,
            }),
        }
    }

    /// Start a retry loop for `key`.
    ///
    /// If the key already has a loop this joins it: nothing is spawned and
    /// `false` is returned.
    pub fn subscribe(&self, key: SubscriptionKey, disconnected_retry_mode: bool) -> bool {
        let backoff = self.inner.config.backoff();
        let initial = backoff.initial_delay.min(backoff.max_delay);

        if !self
            .inner
            .registry
            .register(&key, disconnected_retry_mode, initial)
        {
            debug!(key = %key, "Retry loop already running, joining");
            return false;
        }

        info!(key = %key, disconnected_retry_mode, "Starting subscription retry loop");
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_retry_loop(key, backoff).await;
        });
        true
    }

    /// Cancel the key's loop. It exits at its next checkpoint.
    pub fn cancel(&self, key: &SubscriptionKey) -> bool {
        let cancelled = self.inner.registry.cancel(key);
        if cancelled {
            debug!(key = %key, "Cancelled retry loop");
        }
        cancelled
    }

    /// Cancel every instance of `entity_id`. Returns how many keys were cancelled.
    pub fn cancel_all(&self, entity_id: &str) -> usize {
        let cancelled = self
            .inner
            .registry
            .cancel_where(|key| key.belongs_to(entity_id));
        if !cancelled.is_empty() {
            debug!(entity = entity_id, count = cancelled.len(), "Cancelled retry loops");
        }
        cancelled.len()
    }

    /// Cancel every loop.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.inner.registry.cancel_where(|_| true);
        info!("Cancelled {} retry loops for shutdown", cancelled.len());
        cancelled.len()
    }

    pub fn is_retrying(&self, key: &SubscriptionKey) -> bool {
        self.inner.registry.contains(key)
    }

    pub fn retry_status(&self, key: &SubscriptionKey) -> Option<RetryStatus> {
        self.inner.registry.status(key)
    }

    /// True if any instance of the entity still has a loop.
    pub fn has_active_loop(&self, entity_id: &str) -> bool {
        self.inner.registry.has_entity(entity_id)
    }

    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.inner.registry.keys()
    }

    pub fn is_resubscribing(&self, entity_id: &str) -> bool {
        self.inner.registry.is_resubscribing(entity_id)
    }
}
