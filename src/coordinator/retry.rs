//! Per-key retry loop.
//!
//! Each iteration makes one subscribe attempt, interprets the result, then
//! waits out an exponential backoff before the next attempt. The loop only
//! stops when it observes cancellation at a checkpoint (the end of an
//! attempt or the backoff wait), or after a success when `stop_on_success`
//! is set. The in-flight transport call itself is never interrupted.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Coordinator, Inner};
use crate::common::{
    Backoff, BackoffConfig, ConnectionLock, RateLimitReason, SubscriptionKey, TransportError,
};

/// Removes the key from the registry when the loop exits, however it exits.
struct Registration {
    inner: Arc<Inner>,
    key: SubscriptionKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.registry.remove(&self.key);
    }
}

/// What the loop does after an attempt's result has been handled.
enum AttemptOutcome {
    Subscribed,
    Failed,
    Cancelled,
}

impl Coordinator {
    pub(super) async fn run_retry_loop(self, key: SubscriptionKey, backoff: BackoffConfig) {
        let _registration = Registration {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        };
        let registry = &self.inner.registry;
        let mut backoff = Backoff::new(backoff);

        loop {
            let (attempt_tx, attempt_rx) = oneshot::channel();
            if !registry.begin_attempt(&key, attempt_tx) {
                break;
            }

            let outcome = self.attempt(&key, &backoff, attempt_rx).await;
            if matches!(outcome, AttemptOutcome::Cancelled) {
                debug!(key = %key, "Cancellation observed during attempt");
                break;
            }

            if !registry.finish_attempt(&key) {
                debug!(key = %key, "Cancellation observed after attempt");
                break;
            }
            if matches!(outcome, AttemptOutcome::Subscribed) && self.inner.config.stop_on_success {
                break;
            }

            let delay = backoff.next_delay();
            let (wait_tx, wait_rx) = oneshot::channel();
            if !registry.begin_wait(&key, wait_tx, delay) {
                break;
            }

            debug!(
                key = %key,
                attempt = backoff.attempts(),
                "Retrying subscribe in {:.1}s",
                delay.as_secs_f64()
            );

            let proceed = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                resolved = wait_rx => resolved.unwrap_or(false),
            };
            if !proceed {
                debug!(key = %key, "Cancellation observed during backoff");
                break;
            }
            registry.clear_wait(&key);
        }

        info!(key = %key, "Subscription retry loop stopped");
    }

    /// One subscribe attempt plus any rate-limit delay it asks for.
    ///
    /// Resolution of `attempt_rx` before the call completes means the key
    /// was cancelled. The call runs in its own task so that abandoning the
    /// wait leaves it running to completion.
    async fn attempt(
        &self,
        key: &SubscriptionKey,
        backoff: &Backoff,
        mut attempt_rx: oneshot::Receiver<bool>,
    ) -> AttemptOutcome {
        let transport = Arc::clone(&self.inner.transport);
        let entity_id = key.entity_id.clone();
        let instance_index = key.instance_index;
        let call =
            tokio::spawn(async move { transport.subscribe(&entity_id, instance_index).await });

        let joined = tokio::select! {
            joined = call => joined,
            _ = &mut attempt_rx => return AttemptOutcome::Cancelled,
        };

        match joined {
            Ok(Ok(())) => {
                info!(key = %key, "Subscribed");
                AttemptOutcome::Subscribed
            }
            Ok(Err(TransportError::RateLimited { reason, retry_at })) => {
                if reason.is_permanent() {
                    self.lock_over_limit(key, reason);
                    return AttemptOutcome::Failed;
                }

                // Don't fire again before the server-recommended time.
                let Some(retry_at) = retry_at else {
                    warn!(key = %key, reason = %reason, "Subscribe rate limited");
                    return AttemptOutcome::Failed;
                };
                let extra = retry_at
                    .saturating_duration_since(Instant::now())
                    .saturating_sub(backoff.current());
                warn!(
                    key = %key,
                    reason = %reason,
                    "Subscribe rate limited, delaying an extra {:.1}s",
                    extra.as_secs_f64()
                );
                if extra.is_zero() {
                    return AttemptOutcome::Failed;
                }

                tokio::select! {
                    _ = tokio::time::sleep(extra) => AttemptOutcome::Failed,
                    _ = &mut attempt_rx => AttemptOutcome::Cancelled,
                }
            }
            Ok(Err(e)) => {
                warn!(key = %key, "Subscribe attempt failed: {}", e);
                AttemptOutcome::Failed
            }
            Err(e) => {
                error!(key = %key, "Subscribe task aborted: {}", e);
                AttemptOutcome::Failed
            }
        }
    }

    /// The connection is over its subscription limit: take the entity off it
    /// and let the transport lock it until the limit clears.
    fn lock_over_limit(&self, key: &SubscriptionKey, reason: RateLimitReason) {
        let transport = &self.inner.transport;
        let Some(connection) = transport.connection_binding_of(&key.entity_id) else {
            warn!(
                key = %key,
                reason = %reason,
                "Subscription limit hit but entity has no connection binding"
            );
            return;
        };

        warn!(
            key = %key,
            connection,
            reason = %reason,
            "Subscription limit hit, unbinding entity and locking connection"
        );
        transport.unbind(&key.entity_id);
        transport.lock_connection(
            connection,
            ConnectionLock {
                reason,
                entity_id: key.entity_id.clone(),
                instance_index: key.instance_index,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_support::*;
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::transport::{SimOutcome, SimulatedTransport};

    fn offsets(transport: &SimulatedTransport, key: &SubscriptionKey, start: Instant) -> Vec<Duration> {
        transport
            .calls_for(key)
            .iter()
            .map(|call| call.at.duration_since(start))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_stops_when_configured() {
        let config = CoordinatorConfig {
            stop_on_success: true,
            ..CoordinatorConfig::default()
        };
        let (coordinator, transport) = coordinator_with(config);
        transport.script(
            "acc1",
            [
                SimOutcome::Fail("connection reset".to_string()),
                SimOutcome::Fail("connection reset".to_string()),
            ],
        );
        let key = SubscriptionKey::primary("acc1");
        let start = Instant::now();

        assert!(coordinator.subscribe(key.clone(), false));
        tokio::time::sleep(Duration::from_secs(60)).await;

        let offsets = offsets(&transport, &key, start);
        assert_eq!(offsets.len(), 3);
        assert_about(offsets[1] - offsets[0], Duration::from_secs(3));
        assert_about(offsets[2] - offsets[1], Duration::from_secs(6));
        assert!(!coordinator.is_retrying(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_continues_after_success_by_default() {
        let (coordinator, transport) = coordinator();
        let key = SubscriptionKey::primary("acc1");
        let start = Instant::now();

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let offsets = offsets(&transport, &key, start);
        assert_eq!(offsets.len(), 3);
        assert_about(offsets[2], Duration::from_secs(9));
        assert!(coordinator.is_retrying(&key));

        assert!(coordinator.cancel(&key));
        settle().await;
        assert!(!coordinator.is_retrying(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let (coordinator, transport) = coordinator();
        let key = SubscriptionKey::primary("acc1");
        transport.script("acc1", (0..12).map(|_| SimOutcome::Fail("nope".to_string())));
        let start = Instant::now();

        coordinator.subscribe(key.clone(), false);
        // 3+6+12+24+48+96+192+300+300 = 981
        tokio::time::sleep(Duration::from_secs(990)).await;

        let offsets = offsets(&transport, &key, start);
        let gaps: Vec<Duration> = offsets.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [3, 6, 12, 24, 48, 96, 192, 300, 300];
        assert_eq!(gaps.len(), expected.len());
        for (gap, secs) in gaps.iter().zip(expected) {
            assert_about(*gap, Duration::from_secs(secs));
        }
        assert_eq!(
            coordinator.retry_status(&key).unwrap().backoff,
            Duration::from_secs(300)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_wait() {
        let (coordinator, transport) = coordinator();
        let key = SubscriptionKey::primary("acc1");

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            coordinator.retry_status(&key).unwrap().backoff,
            Duration::from_secs(3)
        );

        assert!(coordinator.cancel(&key));
        settle().await;
        assert!(!coordinator.is_retrying(&key));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls_for(&key).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_does_not_wait_for_call() {
        let transport = Arc::new(SimulatedTransport::new().with_latency(Duration::from_secs(5)));
        let coordinator = Coordinator::new(transport.clone(), CoordinatorConfig::default());
        let key = SubscriptionKey::primary("acc1");

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.max_in_flight(&key), 1);

        coordinator.cancel(&key);
        settle().await;
        assert!(!coordinator.is_retrying(&key));

        // Key is free again for a fresh loop
        assert!(coordinator.subscribe(key.clone(), false));
        coordinator.cancel(&key);
        settle().await;
        assert!(!coordinator.is_retrying(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_limit_unbinds_and_locks_once() {
        let (coordinator, transport) = coordinator();
        transport.bind("acc1", 4);
        transport.script(
            "acc1",
            [SimOutcome::RateLimited {
                reason: RateLimitReason::UserServerSubscriptionLimit,
                retry_after: Some(Duration::from_secs(120)),
            }],
        );
        let key = SubscriptionKey::primary("acc1");
        let start = Instant::now();

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(transport.unbound(), vec!["acc1"]);
        assert_eq!(
            transport.locks(),
            vec![(
                4,
                ConnectionLock {
                    reason: RateLimitReason::UserServerSubscriptionLimit,
                    entity_id: "acc1".to_string(),
                    instance_index: 0,
                }
            )]
        );
        // The recommended retry time is ignored for permanent limits
        let offsets = offsets(&transport, &key, start);
        assert_eq!(offsets.len(), 2);
        assert_about(offsets[1], Duration::from_secs(3));

        coordinator.cancel(&key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_limit_without_binding_keeps_retrying() {
        let (coordinator, transport) = coordinator();
        transport.script(
            "acc1",
            [SimOutcome::RateLimited {
                reason: RateLimitReason::ServerSubscriptionLimit,
                retry_after: None,
            }],
        );
        let key = SubscriptionKey::primary("acc1");
        let start = Instant::now();

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(transport.unbound().is_empty());
        assert!(transport.locks().is_empty());
        assert!(coordinator.is_retrying(&key));
        let offsets = offsets(&transport, &key, start);
        assert_eq!(offsets.len(), 2);
        assert_about(offsets[1], Duration::from_secs(3));

        coordinator.cancel(&key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_recommended_time() {
        let (coordinator, transport) = coordinator();
        transport.script(
            "acc1",
            [SimOutcome::RateLimited {
                reason: RateLimitReason::from_code("too_many_requests"),
                retry_after: Some(Duration::from_secs(10)),
            }],
        );
        let key = SubscriptionKey::primary("acc1");
        let start = Instant::now();

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(transport.calls_for(&key).len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let offsets = offsets(&transport, &key, start);
        assert_eq!(offsets.len(), 2);
        assert_about(offsets[1], Duration::from_secs(10));
        assert!(transport.locks().is_empty());

        coordinator.cancel(&key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sooner_than_backoff_adds_nothing() {
        let (coordinator, transport) = coordinator();
        transport.script(
            "acc1",
            [SimOutcome::RateLimited {
                reason: RateLimitReason::from_code("too_many_requests"),
                retry_after: Some(Duration::from_secs(1)),
            }],
        );
        let key = SubscriptionKey::primary("acc1");
        let start = Instant::now();

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(4)).await;

        let offsets = offsets(&transport, &key, start);
        assert_eq!(offsets.len(), 2);
        assert_about(offsets[1], Duration::from_secs(3));

        coordinator.cancel(&key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rate_limit_delay() {
        let (coordinator, transport) = coordinator();
        transport.script(
            "acc1",
            [SimOutcome::RateLimited {
                reason: RateLimitReason::from_code("too_many_requests"),
                retry_after: Some(Duration::from_secs(60)),
            }],
        );
        let key = SubscriptionKey::primary("acc1");

        coordinator.subscribe(key.clone(), false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        coordinator.cancel(&key);
        settle().await;

        assert!(!coordinator.is_retrying(&key));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.calls_for(&key).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_mode_is_reported() {
        let (coordinator, _transport) = coordinator();
        let key = SubscriptionKey::new("acc1", 2);

        coordinator.subscribe(key.clone(), true);
        let status = coordinator.retry_status(&key).unwrap();
        assert!(status.active);
        assert!(status.disconnected_retry_mode);

        coordinator.cancel(&key);
        assert!(!coordinator.retry_status(&key).unwrap().active);
        settle().await;
        assert_eq!(coordinator.retry_status(&key), None);
    }
}
