//! Subkeeper simulator
//!
//! Runs the subscription coordinator against an in-memory transport and
//! injects random timeout, disconnect and reconnect events so the retry
//! behaviour can be watched in the logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::signal;
use tracing::{error, info};

use subkeeper::config::{env::get_config_path, load_and_validate, SimulationConfig};
use subkeeper::{Coordinator, SimulatedTransport, SubscriptionKey};

/// A lifecycle event picked by the simulator.
#[derive(Debug)]
enum SimEvent {
    Timeout { entity_id: String, instance_index: u32 },
    Disconnect { entity_id: String, instance_index: u32 },
    Reconnect { connection: usize },
}

fn pick_event(config: &SimulationConfig) -> Option<SimEvent> {
    let mut rng = rand::thread_rng();
    let entity_id = config.entities.choose(&mut rng)?.clone();
    let instance_index = rng.gen_range(0..config.instances_per_entity.max(1));

    Some(match rng.gen_range(0..3) {
        0 => SimEvent::Timeout {
            entity_id,
            instance_index,
        },
        1 => SimEvent::Disconnect {
            entity_id,
            instance_index,
        },
        _ => SimEvent::Reconnect {
            connection: rng.gen_range(0..config.connections.max(1)),
        },
    })
}

/// Entities are spread round-robin over the simulated connections.
fn connection_of(config: &SimulationConfig, position: usize) -> usize {
    position % config.connections.max(1)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Subkeeper v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let simulation = config.simulation.clone();
    info!("Configuration loaded successfully");
    info!("  Entities: {}", simulation.entities.join(", "));
    info!("  Instances per entity: {}", simulation.instances_per_entity);
    info!("  Connections: {}", simulation.connections);
    info!(
        "  Backoff: {}s -> {}s (x{})",
        config.coordinator.initial_backoff_secs,
        config.coordinator.max_backoff_secs,
        config.coordinator.backoff_multiplier
    );

    // ============================================================
    // Wire transport and coordinator
    // ============================================================
    let transport = Arc::new(SimulatedTransport::from_config(&simulation));
    for connection in 0..simulation.connections {
        transport.set_connected(connection, true);
    }
    for (position, entity_id) in simulation.entities.iter().enumerate() {
        transport.bind(entity_id, connection_of(&simulation, position));
    }

    let coordinator = Coordinator::new(transport.clone(), config.coordinator.clone());
    for entity_id in &simulation.entities {
        for instance_index in 0..simulation.instances_per_entity {
            coordinator.subscribe(SubscriptionKey::new(entity_id.as_str(), instance_index), false);
        }
    }

    // ============================================================
    // Inject lifecycle events until shutdown
    // ============================================================
    let events = {
        let coordinator = coordinator.clone();
        let transport = transport.clone();
        let simulation = simulation.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + Duration::from_secs(simulation.event_interval_secs),
                Duration::from_secs(simulation.event_interval_secs),
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(event) = pick_event(&simulation) else {
                    continue;
                };
                info!(?event, "Injecting lifecycle event");

                match event {
                    SimEvent::Timeout {
                        entity_id,
                        instance_index,
                    } => {
                        coordinator.on_timeout(&entity_id, instance_index);
                    }
                    SimEvent::Disconnect {
                        entity_id,
                        instance_index,
                    } => {
                        coordinator.on_disconnected(&entity_id, instance_index);
                    }
                    SimEvent::Reconnect { connection } => {
                        // Locked connections come back with their original entities
                        let entities: Vec<String> = simulation
                            .entities
                            .iter()
                            .enumerate()
                            .filter(|(position, _)| connection_of(&simulation, *position) == connection)
                            .map(|(_, entity_id)| entity_id.clone())
                            .collect();
                        for entity_id in &entities {
                            transport.bind(entity_id, connection);
                        }
                        coordinator.on_reconnected(connection, &entities);
                    }
                }
                info!(active = coordinator.active_keys().len(), "Retry loops running");
            }
        })
    };

    shutdown_signal().await;
    info!("Shutdown signal received - cancelling retry loops...");
    events.abort();
    coordinator.shutdown();

    // Give loops a moment to observe cancellation
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        "Exiting after {} subscribe calls ({} loops still draining)",
        transport.calls().len(),
        coordinator.active_keys().len()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
