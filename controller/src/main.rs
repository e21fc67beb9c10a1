//! Polyrec Controller – drives a fleet of capture devices over the LAN.
//!
//! This binary:
//! 1. Probes for devices over UDP broadcast (plus an optional mDNS scan)
//! 2. Connects to each discovered device's TCP command channel
//! 3. Polls device status and keeps per-device clock offsets estimated
//! 4. Starts and stops recording sessions across the connected fleet

mod connection;
mod registry;
mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyrec_common::config::Config;
use polyrec_common::protocol::Command;
use polyrec_common::sync::MonotonicClock;

use connection::{ConnectionError, ConnectionEvent, DeviceConnection};
use registry::{DeviceRegistry, RegistryEvent};

/// Live connections and their task-scope tokens, keyed by device id.
struct Fleet {
    connections: HashMap<String, (Arc<DeviceConnection>, CancellationToken)>,
    config: Config,
    clock: MonotonicClock,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Fleet {
    async fn connect(&mut self, device: &registry::DiscoveredDevice) {
        if self.connections.contains_key(&device.device_id) {
            return;
        }
        let result = DeviceConnection::connect(
            &device.device_id,
            device.command_addr(),
            Duration::from_secs(self.config.connect_timeout_secs),
            self.config.sync_rtt_limit_ms as f64,
            self.clock.clone(),
            self.events.clone(),
        )
        .await;
        let conn = match result {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot connect to {}: {e}", device.device_id);
                return;
            }
        };

        let scope = CancellationToken::new();
        tokio::spawn(sync::run_sync_loop(
            Arc::clone(&conn),
            self.clock.clone(),
            Duration::from_secs(self.config.sync_interval_secs),
            scope.clone(),
        ));
        self.connections
            .insert(device.device_id.clone(), (conn, scope));
    }

    async fn disconnect(&mut self, device_id: &str) {
        if let Some((conn, scope)) = self.connections.remove(device_id) {
            scope.cancel();
            conn.disconnect().await;
        }
    }

    /// Broadcast one command to every idle connection.
    async fn send_to_all(&self, command: &Command) {
        for (id, (conn, _)) in &self.connections {
            match conn.send_command(command).await {
                Ok(()) => {}
                Err(ConnectionError::Busy) => {
                    debug!("{id}: busy, {} skipped", command.name())
                }
                Err(e) => warn!("{id}: {} failed: {e}", command.name()),
            }
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = polyrec_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!(
        "Polyrec Controller starting (discovery_port={}, auto_connect={})",
        config.discovery_port, config.auto_connect
    );

    let cancel = CancellationToken::new();

    // ── ctrl-c ───────────────────────────────────────────────────────
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            cancel.cancel();
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── device registry + discovery tasks ────────────────────────────
    let (registry, mut registry_events) = DeviceRegistry::new(Duration::from_secs(
        config.liveness_timeout_secs,
    ));
    let registry = Arc::new(registry);

    let discovery_task = {
        let registry = Arc::clone(&registry);
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                registry::run_broadcast_discovery(registry, config, cancel).await
            {
                tracing::error!("Broadcast discovery error: {e:#}");
            }
        })
    };
    let sweep_task = tokio::spawn(registry::run_sweep(
        Arc::clone(&registry),
        Duration::from_secs(config.sweep_interval_secs),
        cancel.clone(),
    ));
    if config.enable_mdns {
        registry::spawn_mdns_browse(Arc::clone(&registry), cancel.clone());
    }

    // ── fleet orchestration ──────────────────────────────────────────
    let (conn_tx, mut conn_events) = mpsc::unbounded_channel();
    let mut fleet = Fleet {
        connections: HashMap::new(),
        config: config.clone(),
        clock: MonotonicClock::new(),
        events: conn_tx,
    };
    let mut status_tick =
        tokio::time::interval(Duration::from_secs(config.status_poll_secs));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = registry_events.recv() => {
                match event {
                    Some(RegistryEvent::Discovered(device)) => {
                        if config.auto_connect {
                            fleet.connect(&device).await;
                        } else {
                            info!(
                                "Device {} available at {} (auto_connect off)",
                                device.device_id,
                                device.command_addr()
                            );
                        }
                    }
                    Some(RegistryEvent::Evicted(id)) => {
                        fleet.disconnect(&id).await;
                    }
                    None => break,
                }
            }

            event = conn_events.recv() => {
                let Some(event) = event else { break };
                handle_connection_event(&mut fleet, event).await;
            }

            _ = status_tick.tick() => {
                fleet.send_to_all(&Command::GetStatus).await;
            }
        }
    }

    // ── shutdown ─────────────────────────────────────────────────────
    fleet.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        let _ = discovery_task.await;
        let _ = sweep_task.await;
    })
    .await;

    info!("Polyrec Controller stopped");
    Ok(())
}

async fn handle_connection_event(fleet: &mut Fleet, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected { device_id } => {
            info!("{device_id}: command channel up");
        }
        ConnectionEvent::Acknowledged { device_id, command, message } => {
            info!("{device_id}: {command} acknowledged: {message}");
        }
        ConnectionEvent::Rejected { device_id, code, message } => {
            warn!("{device_id}: command rejected ({code:?}): {message}");
        }
        ConnectionEvent::Status { device_id, state } => {
            debug!(
                "{device_id}: recording={} session={:?} battery={:?}",
                state.is_recording, state.session_id, state.battery_percent
            );
        }
        ConnectionEvent::SyncUpdated { device_id, offset_ms, rtt_ms } => {
            debug!("{device_id}: clock offset {offset_ms:.1}ms (rtt {rtt_ms:.1}ms)");
        }
        ConnectionEvent::Disconnected { device_id } => {
            // The device may reappear through discovery later; its registry
            // entry stays until the liveness sweep drops it.
            fleet.disconnect(&device_id).await;
        }
    }
}
