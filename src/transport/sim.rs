//! In-memory transport.
//!
//! Keeps connection bindings and connection state in memory, answers
//! subscribe calls from a per-entity script or from configured failure
//! rates, and records every call it receives. Drives the demo binary and
//! the coordinator tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Transport;
use crate::common::{
    ConnectionIndex, ConnectionLock, RateLimitReason, SubscriptionKey, TransportError,
    TransportResult,
};
use crate::config::SimulationConfig;

/// Scripted result of one subscribe call.
#[derive(Debug, Clone)]
pub enum SimOutcome {
    Succeed,
    Fail(String),
    RateLimited {
        reason: RateLimitReason,
        /// Recommended retry time, relative to when the call completes.
        retry_after: Option<Duration>,
    },
}

/// One subscribe call as seen by the transport.
#[derive(Debug, Clone)]
pub struct SubscribeCall {
    pub key: SubscriptionKey,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    bindings: HashMap<String, ConnectionIndex>,
    connected: HashSet<ConnectionIndex>,
    locks: Vec<(ConnectionIndex, ConnectionLock)>,
    unbound: Vec<String>,
    scripts: HashMap<String, VecDeque<SimOutcome>>,
    calls: Vec<SubscribeCall>,
    in_flight: HashMap<SubscriptionKey, usize>,
    max_in_flight: HashMap<SubscriptionKey, usize>,
}

/// Transport that never touches the network.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    latency: Duration,
    failure_rate: f64,
    rate_limit_rate: f64,
}

impl SimulatedTransport {
    /// Transport whose unscripted calls always succeed immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport with latency and failure rates taken from the simulation config.
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            latency: Duration::from_millis(config.latency_ms),
            failure_rate: config.failure_rate,
            rate_limit_rate: config.rate_limit_rate,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Bind an entity to a connection.
    pub fn bind(&self, entity_id: &str, connection: ConnectionIndex) {
        self.state
            .lock()
            .bindings
            .insert(entity_id.to_string(), connection);
    }

    pub fn set_connected(&self, connection: ConnectionIndex, connected: bool) {
        let mut state = self.state.lock();
        if connected {
            state.connected.insert(connection);
        } else {
            state.connected.remove(&connection);
        }
    }

    /// Queue outcomes for the entity's next subscribe calls, any instance.
    pub fn script(&self, entity_id: &str, outcomes: impl IntoIterator<Item = SimOutcome>) {
        self.state
            .lock()
            .scripts
            .entry(entity_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// All subscribe calls received so far.
    pub fn calls(&self) -> Vec<SubscribeCall> {
        self.state.lock().calls.clone()
    }

    /// Subscribe calls received for one key.
    pub fn calls_for(&self, key: &SubscriptionKey) -> Vec<SubscribeCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| &call.key == key)
            .cloned()
            .collect()
    }

    /// Highest number of simultaneous calls observed for one key.
    pub fn max_in_flight(&self, key: &SubscriptionKey) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Connections locked so far, with their lock metadata.
    pub fn locks(&self) -> Vec<(ConnectionIndex, ConnectionLock)> {
        self.state.lock().locks.clone()
    }

    /// Entities unbound so far, in call order.
    pub fn unbound(&self) -> Vec<String> {
        self.state.lock().unbound.clone()
    }

    fn begin_call(&self, key: &SubscriptionKey) -> Option<SimOutcome> {
        let mut state = self.state.lock();
        state.calls.push(SubscribeCall {
            key: key.clone(),
            at: Instant::now(),
        });

        let in_flight = state.in_flight.entry(key.clone()).or_insert(0);
        *in_flight += 1;
        let current = *in_flight;
        let max = state.max_in_flight.entry(key.clone()).or_insert(0);
        *max = (*max).max(current);

        state
            .scripts
            .get_mut(&key.entity_id)
            .and_then(VecDeque::pop_front)
    }

    fn end_call(&self, key: &SubscriptionKey) {
        if let Some(in_flight) = self.state.lock().in_flight.get_mut(key) {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    fn roll_outcome(&self) -> SimOutcome {
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            SimOutcome::Fail("simulated failure".to_string())
        } else if roll < self.failure_rate + self.rate_limit_rate {
            let retry_after = Duration::from_secs(rand::thread_rng().gen_range(1..=30));
            SimOutcome::RateLimited {
                reason: RateLimitReason::Other("too_many_requests".to_string()),
                retry_after: Some(retry_after),
            }
        } else {
            SimOutcome::Succeed
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn subscribe(&self, entity_id: &str, instance_index: u32) -> TransportResult<()> {
        let key = SubscriptionKey::new(entity_id, instance_index);
        let scripted = self.begin_call(&key);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.end_call(&key);

        let outcome = scripted.unwrap_or_else(|| self.roll_outcome());
        debug!(key = %key, ?outcome, "Simulated subscribe");

        match outcome {
            SimOutcome::Succeed => Ok(()),
            SimOutcome::Fail(message) => Err(TransportError::Failed { message }),
            SimOutcome::RateLimited {
                reason,
                retry_after,
            } => Err(TransportError::RateLimited {
                reason,
                retry_at: retry_after.map(|after| Instant::now() + after),
            }),
        }
    }

    fn connection_binding_of(&self, entity_id: &str) -> Option<ConnectionIndex> {
        self.state.lock().bindings.get(entity_id).copied()
    }

    fn is_connected(&self, connection: ConnectionIndex) -> bool {
        self.state.lock().connected.contains(&connection)
    }

    fn unbind(&self, entity_id: &str) {
        let mut state = self.state.lock();
        state.bindings.remove(entity_id);
        state.unbound.push(entity_id.to_string());
    }

    fn lock_connection(&self, connection: ConnectionIndex, lock: ConnectionLock) {
        info!(connection, reason = %lock.reason, entity = %lock.entity_id, "Connection locked");
        self.state.lock().locks.push((connection, lock));
    }
}
