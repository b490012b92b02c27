//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `SUBKEEPER_INITIAL_BACKOFF_SECS` - First backoff wait
//! - `SUBKEEPER_MAX_BACKOFF_SECS` - Backoff cap
//! - `SUBKEEPER_STOP_ON_SUCCESS` - End retry loops after a successful subscribe
//! - `SUBKEEPER_DRAIN_MAX_POLLS` - Bound on reconnect drain polls
//! - `SUBKEEPER_ENTITIES` - Comma-separated entity ids for the simulation

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "SUBKEEPER";

/// Apply environment variable overrides to a config.
///
/// Values that fail to parse are ignored and the file value is kept.
pub fn apply_env_overrides(mut config: Config) -> Config {
    // Backoff
    if let Ok(secs) = env::var(format!("{}_INITIAL_BACKOFF_SECS", ENV_PREFIX)) {
        if let Ok(secs) = secs.parse() {
            config.coordinator.initial_backoff_secs = secs;
        }
    }
    if let Ok(secs) = env::var(format!("{}_MAX_BACKOFF_SECS", ENV_PREFIX)) {
        if let Ok(secs) = secs.parse() {
            config.coordinator.max_backoff_secs = secs;
        }
    }

    // Loop termination
    if let Ok(flag) = env::var(format!("{}_STOP_ON_SUCCESS", ENV_PREFIX)) {
        if let Ok(flag) = flag.parse() {
            config.coordinator.stop_on_success = flag;
        }
    }
    if let Ok(polls) = env::var(format!("{}_DRAIN_MAX_POLLS", ENV_PREFIX)) {
        if let Ok(polls) = polls.parse() {
            config.coordinator.drain_max_polls = Some(polls);
        }
    }

    // Simulation
    if let Ok(entities) = env::var(format!("{}_ENTITIES", ENV_PREFIX)) {
        let entities: Vec<String> = entities
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !entities.is_empty() {
            config.simulation.entities = entities;
        }
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `SUBKEEPER_CONFIG` environment variable, otherwise returns "subkeeper.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "subkeeper.conf".to_string())
}
