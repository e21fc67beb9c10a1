//! Controller-side device registry.
//!
//! Devices discovered over UDP broadcast probing and (best-effort) mDNS
//! scans are merged into one keyed collection.  A probe response for a
//! known device refreshes its `last_seen`; a new device emits a Discovered
//! event.  A periodic sweep evicts devices that have gone silent past the
//! liveness timeout so the UI layer and any active connection can be torn
//! down.
//!
//! The map is mutated by both the discovery task and the sweep task and
//! read by the command layer, so all access goes through one lock.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyrec_common::config::Config;
use polyrec_common::discovery::{
    DiscoveryResponse, DEFAULT_STREAMING_PORT, DISCOVERY_PROBE,
};

/// mDNS service type polyrec devices may additionally advertise.
const MDNS_SERVICE_TYPE: &str = "_polyrec._tcp.local.";

/// Transport a device was discovered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// UDP broadcast probe response.
    Network,
    /// Local-network mDNS scan.
    Mdns,
    /// Peripheral radio enumeration (populated by platform code).
    Peripheral,
}

/// One discovered capture device, whatever transport found it.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub addr: IpAddr,
    pub tcp_port: u16,
    pub streaming_port: u16,
    pub capabilities: Vec<String>,
    pub last_seen: Instant,
}

impl DiscoveredDevice {
    /// The command-channel endpoint.
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.tcp_port)
    }

    fn from_response(resp: DiscoveryResponse, source: SocketAddr) -> Self {
        // Prefer the address the device advertises; fall back to the
        // datagram source when it is unusable.
        let addr = resp
            .ip_address
            .parse()
            .ok()
            .filter(|ip: &IpAddr| !ip.is_unspecified())
            .unwrap_or_else(|| source.ip());
        Self {
            device_id: resp.device_id,
            name: resp.device_name,
            kind: DeviceKind::Network,
            addr,
            tcp_port: resp.tcp_port,
            streaming_port: resp.udp_streaming_port,
            capabilities: resp.device_capabilities,
            last_seen: Instant::now(),
        }
    }
}

/// Registry change notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Discovered(DiscoveredDevice),
    Evicted(String),
}

pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DiscoveredDevice>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    liveness: Duration,
}

impl DeviceRegistry {
    pub fn new(
        liveness: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                devices: Mutex::new(HashMap::new()),
                events: tx,
                liveness,
            },
            rx,
        )
    }

    /// Insert a new device or refresh a known one.
    pub fn observe(&self, device: DiscoveredDevice) {
        self.observe_at(device, Instant::now())
    }

    fn observe_at(&self, mut device: DiscoveredDevice, now: Instant) {
        device.last_seen = now;
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let is_new = !devices.contains_key(&device.device_id);
        devices.insert(device.device_id.clone(), device.clone());
        drop(devices);

        if is_new {
            info!(
                "Discovered device {} ({:?}, {}:{})",
                device.device_id, device.kind, device.addr, device.tcp_port
            );
            let _ = self.events.send(RegistryEvent::Discovered(device));
        } else {
            debug!("Refreshed device {}", device.device_id);
        }
    }

    /// Evict devices unseen past the liveness timeout; returns their ids.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> Vec<String> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = devices
            .iter()
            .filter(|(_, d)| now.duration_since(d.last_seen) > self.liveness)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            devices.remove(id);
        }
        drop(devices);

        for id in &stale {
            warn!("Device {id} went silent, evicting");
            let _ = self.events.send(RegistryEvent::Evicted(id.clone()));
        }
        stale
    }

    pub fn get(&self, device_id: &str) -> Option<DiscoveredDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

// ── discovery tasks ──────────────────────────────────────────────────────

/// Broadcast the probe every `discovery_interval_secs` and fold responses
/// into the registry.  Runs until cancelled.
pub async fn run_broadcast_discovery(
    registry: std::sync::Arc<DeviceRegistry>,
    config: Config,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Cannot bind discovery socket")?;
    socket
        .set_broadcast(true)
        .context("Cannot enable broadcast")?;
    let target = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::BROADCAST),
        config.discovery_port,
    );
    info!(
        "Probing for devices on broadcast :{} every {}s",
        config.discovery_port, config.discovery_interval_secs
    );

    let mut tick =
        tokio::time::interval(Duration::from_secs(config.discovery_interval_secs));
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = socket.send_to(DISCOVERY_PROBE.as_bytes(), target).await {
                    warn!("Discovery probe send failed: {e}");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, source) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Discovery receive error: {e}");
                        continue;
                    }
                };
                match serde_json::from_slice::<DiscoveryResponse>(&buf[..len]) {
                    Ok(resp) => registry
                        .observe(DiscoveredDevice::from_response(resp, source)),
                    Err(e) => debug!("Ignoring malformed discovery reply from {source}: {e}"),
                }
            }
        }
    }

    info!("Broadcast discovery stopped");
    Ok(())
}

/// Periodically evict silent devices.  Runs until cancelled.
pub async fn run_sweep(
    registry: std::sync::Arc<DeviceRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                registry.sweep();
            }
        }
    }
}

/// Best-effort mDNS browse feeding the registry with `DeviceKind::Mdns`
/// entries.  Failures are non-fatal; devices found here follow the same
/// liveness rules as broadcast entries.
pub fn spawn_mdns_browse(
    registry: std::sync::Arc<DeviceRegistry>,
    cancel: CancellationToken,
) {
    tokio::task::spawn_blocking(move || {
        let daemon = match ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                warn!("mDNS unavailable (non-fatal): {e}");
                return;
            }
        };
        let receiver = match daemon.browse(MDNS_SERVICE_TYPE) {
            Ok(r) => r,
            Err(e) => {
                warn!("mDNS browse failed (non-fatal): {e}");
                return;
            }
        };
        debug!("mDNS: browsing for {MDNS_SERVICE_TYPE}");

        while !cancel.is_cancelled() {
            match receiver.recv_timeout(Duration::from_secs(1)) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let instance = info
                        .get_fullname()
                        .split('.')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    let Some(addr) = info
                        .get_addresses()
                        .iter()
                        .map(|a| a.to_ip_addr())
                        .find(|a| a.is_ipv4())
                    else {
                        continue;
                    };
                    registry.observe(DiscoveredDevice {
                        device_id: instance.clone(),
                        name: instance,
                        kind: DeviceKind::Mdns,
                        addr,
                        tcp_port: info.get_port(),
                        streaming_port: DEFAULT_STREAMING_PORT,
                        capabilities: vec![],
                        last_seen: Instant::now(),
                    });
                }
                Ok(event) => debug!("mDNS: {}", format_event(&event)),
                Err(_) => {} // timeout; re-check cancellation
            }
        }

        let _ = daemon.stop_browse(MDNS_SERVICE_TYPE);
        let _ = daemon.shutdown();
        debug!("mDNS browse stopped");
    });
}

/// Format a ServiceEvent for debug logging (without dumping the full struct).
fn format_event(event: &ServiceEvent) -> String {
    match event {
        ServiceEvent::ServiceFound(ty, name) => format!("Found({ty}, {name})"),
        ServiceEvent::ServiceResolved(info) => {
            format!("Resolved({})", info.get_fullname())
        }
        ServiceEvent::ServiceRemoved(ty, name) => format!("Removed({ty}, {name})"),
        ServiceEvent::SearchStarted(ty) => format!("SearchStarted({ty})"),
        ServiceEvent::SearchStopped(ty) => format!("SearchStopped({ty})"),
        _ => "Other".to_string(),
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
