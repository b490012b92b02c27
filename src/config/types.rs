//! Configuration type definitions.

use std::time::Duration;

use serde::Deserialize;

use crate::common::BackoffConfig;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Retry and lifecycle timing for the subscription coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// First backoff wait, in seconds.
    pub initial_backoff_secs: u64,
    /// Cap for any backoff wait, in seconds.
    pub max_backoff_secs: u64,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Lower bound of the jitter applied before a disconnect resubscribe.
    pub disconnect_jitter_min_ms: u64,
    /// Upper bound of the jitter applied before a disconnect resubscribe.
    pub disconnect_jitter_max_ms: u64,
    /// Lower bound of the jitter applied before a reconnect resubscribe.
    pub reconnect_jitter_min_ms: u64,
    /// Upper bound of the jitter applied before a reconnect resubscribe.
    pub reconnect_jitter_max_ms: u64,
    /// How often a reconnect checks whether stale retry loops have drained.
    pub drain_poll_interval_ms: u64,
    /// Give up on a drain after this many polls (None = wait forever).
    pub drain_max_polls: Option<usize>,
    /// End a retry loop after its first successful subscribe.
    pub stop_on_success: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 3,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
            disconnect_jitter_min_ms: 1000,
            disconnect_jitter_max_ms: 5000,
            reconnect_jitter_min_ms: 0,
            reconnect_jitter_max_ms: 5000,
            drain_poll_interval_ms: 1000,
            drain_max_polls: None,
            stop_on_success: false,
        }
    }
}

impl CoordinatorConfig {
    /// Backoff settings for a new retry loop.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(self.initial_backoff_secs),
            max_delay: Duration::from_secs(self.max_backoff_secs),
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// Settings for the simulated transport driven by the demo binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Entity ids to subscribe.
    pub entities: Vec<String>,
    /// Streams per entity (instance indexes `0..instances_per_entity`).
    pub instances_per_entity: u32,
    /// Number of simulated connections; entities are spread round-robin.
    pub connections: usize,
    /// Probability that a subscribe fails with a generic error.
    pub failure_rate: f64,
    /// Probability that a subscribe is rate limited with a retry time.
    pub rate_limit_rate: f64,
    /// Simulated latency of one subscribe call, in milliseconds.
    pub latency_ms: u64,
    /// Interval between injected lifecycle events, in seconds.
    pub event_interval_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            entities: vec!["acc1".to_string(), "acc2".to_string(), "acc3".to_string()],
            instances_per_entity: 1,
            connections: 2,
            failure_rate: 0.3,
            rate_limit_rate: 0.05,
            latency_ms: 200,
            event_interval_secs: 20,
        }
    }
}
