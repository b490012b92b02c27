//! Retry registry.
//!
//! Maps each key to the control state of its retry loop. Every check and
//! write happens under one short lock that is never held across an
//! `.await`, so "check then register" is atomic per key.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::common::SubscriptionKey;

/// Control state of one live retry loop.
#[derive(Debug)]
pub struct RetryState {
    /// Continue-flag. Cleared by cancellation; the loop checks it after each attempt.
    pub active: bool,
    /// The loop was started by a disconnect rather than a fresh subscribe.
    pub disconnected_retry_mode: bool,
    /// Force-resolves the loop's wait on the in-flight attempt.
    pub current_attempt: Option<oneshot::Sender<bool>>,
    /// Force-resolves the loop's current backoff wait.
    pub pending_wait: Option<oneshot::Sender<bool>>,
    /// Current backoff interval. Written only by the loop.
    pub backoff: Duration,
}

impl RetryState {
    fn new(disconnected_retry_mode: bool, backoff: Duration) -> Self {
        Self {
            active: true,
            disconnected_retry_mode,
            current_attempt: None,
            pending_wait: None,
            backoff,
        }
    }

    /// Resolve both handles with `false` and clear the continue-flag.
    fn cancel(&mut self) {
        if let Some(wait) = self.pending_wait.take() {
            let _ = wait.send(false);
        }
        if let Some(attempt) = self.current_attempt.take() {
            let _ = attempt.send(false);
        }
        self.active = false;
    }
}

/// Read-only view of a key's retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStatus {
    pub active: bool,
    pub disconnected_retry_mode: bool,
    pub backoff: Duration,
}

impl From<&RetryState> for RetryStatus {
    fn from(state: &RetryState) -> Self {
        Self {
            active: state.active,
            disconnected_retry_mode: state.disconnected_retry_mode,
            backoff: state.backoff,
        }
    }
}

/// Registry of live retry loops plus the resubscribe-dedup set.
#[derive(Debug, Default)]
pub struct RetryRegistry {
    loops: Mutex<HashMap<SubscriptionKey, RetryState>>,
    resubscribing: Mutex<HashSet<String>>,
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new loop for `key`. Returns false if one already exists.
    pub fn register(
        &self,
        key: &SubscriptionKey,
        disconnected_retry_mode: bool,
        backoff: Duration,
    ) -> bool {
        let mut loops = self.loops.lock();
        if loops.contains_key(key) {
            return false;
        }
        loops.insert(
            key.clone(),
            RetryState::new(disconnected_retry_mode, backoff),
        );
        true
    }

    /// Remove the key's state. Called only by the owning loop on exit.
    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        self.loops.lock().remove(key).is_some()
    }

    /// Store a fresh attempt handle. Returns false if the key is gone or cancelled.
    pub fn begin_attempt(&self, key: &SubscriptionKey, attempt: oneshot::Sender<bool>) -> bool {
        match self.loops.lock().get_mut(key) {
            Some(state) if state.active => {
                state.current_attempt = Some(attempt);
                true
            }
            _ => false,
        }
    }

    /// Resolve the attempt handle. Returns whether the loop should continue.
    pub fn finish_attempt(&self, key: &SubscriptionKey) -> bool {
        match self.loops.lock().get_mut(key) {
            Some(state) => {
                if let Some(attempt) = state.current_attempt.take() {
                    let _ = attempt.send(true);
                }
                state.active
            }
            None => false,
        }
    }

    /// Store the pending-wait handle and the interval being waited.
    /// Returns false if the loop was cancelled in the meantime.
    pub fn begin_wait(
        &self,
        key: &SubscriptionKey,
        wait: oneshot::Sender<bool>,
        backoff: Duration,
    ) -> bool {
        match self.loops.lock().get_mut(key) {
            Some(state) if state.active => {
                state.pending_wait = Some(wait);
                state.backoff = backoff;
                true
            }
            _ => false,
        }
    }

    pub fn clear_wait(&self, key: &SubscriptionKey) {
        if let Some(state) = self.loops.lock().get_mut(key) {
            state.pending_wait = None;
        }
    }

    /// Cancel one key. Returns false if it was not registered.
    pub fn cancel(&self, key: &SubscriptionKey) -> bool {
        match self.loops.lock().get_mut(key) {
            Some(state) => {
                state.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every key matching `predicate`. Returns the cancelled keys.
    pub fn cancel_where(
        &self,
        mut predicate: impl FnMut(&SubscriptionKey) -> bool,
    ) -> Vec<SubscriptionKey> {
        let mut loops = self.loops.lock();
        let mut cancelled = Vec::new();
        for (key, state) in loops.iter_mut() {
            if predicate(key) {
                state.cancel();
                cancelled.push(key.clone());
            }
        }
        cancelled.sort();
        cancelled
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.loops.lock().contains_key(key)
    }

    pub fn status(&self, key: &SubscriptionKey) -> Option<RetryStatus> {
        self.loops.lock().get(key).map(RetryStatus::from)
    }

    /// True if any instance of `entity_id` still has a loop.
    pub fn has_entity(&self, entity_id: &str) -> bool {
        self.loops.lock().keys().any(|key| key.belongs_to(entity_id))
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.loops.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.loops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.lock().is_empty()
    }

    /// Add an entity to the resubscribe-dedup set. Returns false if present.
    pub fn mark_resubscribing(&self, entity_id: &str) -> bool {
        self.resubscribing.lock().insert(entity_id.to_string())
    }

    pub fn clear_resubscribing(&self, entity_id: &str) {
        self.resubscribing.lock().remove(entity_id);
    }

    pub fn is_resubscribing(&self, entity_id: &str) -> bool {
        self.resubscribing.lock().contains(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKOFF: Duration = Duration::from_secs(3);

    #[test]
    fn test_register_is_exclusive_per_key() {
        let registry = RetryRegistry::new();
        let key = SubscriptionKey::primary("acc1");

        assert!(registry.register(&key, false, BACKOFF));
        assert!(!registry.register(&key, true, BACKOFF));
        assert!(registry.register(&SubscriptionKey::new("acc1", 1), false, BACKOFF));
        assert_eq!(registry.len(), 2);

        // The first registration wins
        let status = registry.status(&key).unwrap();
        assert!(!status.disconnected_retry_mode);
    }

    #[test]
    fn test_cancel_resolves_handles_with_false() {
        let registry = RetryRegistry::new();
        let key = SubscriptionKey::primary("acc1");
        registry.register(&key, false, BACKOFF);

        let (attempt_tx, mut attempt_rx) = oneshot::channel();
        assert!(registry.begin_attempt(&key, attempt_tx));
        let (wait_tx, mut wait_rx) = oneshot::channel();
        assert!(registry.begin_wait(&key, wait_tx, BACKOFF));

        assert!(registry.cancel(&key));
        assert_eq!(attempt_rx.try_recv(), Ok(false));
        assert_eq!(wait_rx.try_recv(), Ok(false));

        // Still registered until the loop removes it, but no longer active
        assert!(registry.contains(&key));
        assert!(!registry.status(&key).unwrap().active);
        assert!(!registry.finish_attempt(&key));
    }

    #[test]
    fn test_cancel_missing_key() {
        let registry = RetryRegistry::new();
        assert!(!registry.cancel(&SubscriptionKey::primary("nobody")));
    }

    #[test]
    fn test_cancel_where_matches_exact_entity() {
        let registry = RetryRegistry::new();
        for key in [
            SubscriptionKey::new("A", 0),
            SubscriptionKey::new("A", 1),
            SubscriptionKey::new("AB", 0),
        ] {
            registry.register(&key, false, BACKOFF);
        }

        let cancelled = registry.cancel_where(|key| key.belongs_to("A"));
        assert_eq!(
            cancelled,
            vec![SubscriptionKey::new("A", 0), SubscriptionKey::new("A", 1)]
        );
        assert!(registry.status(&SubscriptionKey::new("AB", 0)).unwrap().active);
    }

    #[test]
    fn test_has_entity_and_remove() {
        let registry = RetryRegistry::new();
        let key = SubscriptionKey::new("acc1", 3);
        registry.register(&key, false, BACKOFF);

        assert!(registry.has_entity("acc1"));
        assert!(!registry.has_entity("acc"));
        assert!(registry.remove(&key));
        assert!(!registry.has_entity("acc1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resubscribe_dedup_set() {
        let registry = RetryRegistry::new();
        assert!(registry.mark_resubscribing("acc1"));
        assert!(!registry.mark_resubscribing("acc1"));
        assert!(registry.is_resubscribing("acc1"));

        registry.clear_resubscribing("acc1");
        assert!(!registry.is_resubscribing("acc1"));
        assert!(registry.mark_resubscribing("acc1"));
    }
}
