//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use crate::common::error::ConfigError;
use crate::config::types::Config;

/// Longest backoff wait a config may ask for: one day.
pub const MAX_BACKOFF_LIMIT_SECS: u64 = 86_400;

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let coordinator = &config.coordinator;

    // Backoff
    if coordinator.initial_backoff_secs == 0 {
        errors.push("coordinator.initial_backoff_secs must be non-zero".to_string());
    }
    if coordinator.max_backoff_secs < coordinator.initial_backoff_secs {
        errors.push(format!(
            "coordinator.max_backoff_secs ({}) must not be below initial_backoff_secs ({})",
            coordinator.max_backoff_secs, coordinator.initial_backoff_secs
        ));
    }
    if coordinator.max_backoff_secs > MAX_BACKOFF_LIMIT_SECS {
        errors.push(format!(
            "coordinator.max_backoff_secs ({}) must not exceed {}",
            coordinator.max_backoff_secs, MAX_BACKOFF_LIMIT_SECS
        ));
    }
    if coordinator.backoff_multiplier.is_nan() || coordinator.backoff_multiplier < 1.0 {
        errors.push(format!(
            "coordinator.backoff_multiplier must be at least 1.0 (got {})",
            coordinator.backoff_multiplier
        ));
    }

    // Jitter and drain timing
    if coordinator.disconnect_jitter_max_ms < coordinator.disconnect_jitter_min_ms {
        errors.push(
            "coordinator.disconnect_jitter_max_ms must not be below disconnect_jitter_min_ms"
                .to_string(),
        );
    }
    if coordinator.reconnect_jitter_max_ms < coordinator.reconnect_jitter_min_ms {
        errors.push(
            "coordinator.reconnect_jitter_max_ms must not be below reconnect_jitter_min_ms"
                .to_string(),
        );
    }
    if coordinator.drain_poll_interval_ms == 0 {
        errors.push("coordinator.drain_poll_interval_ms must be non-zero".to_string());
    }
    if coordinator.drain_max_polls == Some(0) {
        errors.push("coordinator.drain_max_polls must be non-zero when set".to_string());
    }

    // Simulation
    let simulation = &config.simulation;
    if simulation.connections == 0 {
        errors.push("simulation.connections must be non-zero".to_string());
    }
    if simulation.instances_per_entity == 0 {
        errors.push("simulation.instances_per_entity must be non-zero".to_string());
    }
    for (name, rate) in [
        ("failure_rate", simulation.failure_rate),
        ("rate_limit_rate", simulation.rate_limit_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            errors.push(format!("simulation.{} must be within 0.0-1.0 (got {})", name, rate));
        }
    }
    if simulation.failure_rate + simulation.rate_limit_rate > 1.0 {
        errors.push("simulation.failure_rate + rate_limit_rate must not exceed 1.0".to_string());
    }
    if simulation.event_interval_secs == 0 {
        errors.push("simulation.event_interval_secs must be non-zero".to_string());
    }
    for (i, entity) in simulation.entities.iter().enumerate() {
        if entity.is_empty() {
            errors.push(format!("simulation.entities[{}] is empty", i));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
