//! Discovery responder: answers controller broadcast probes with the
//! device's identity and ports.
//!
//! Stateless and best-effort: a matching probe gets one unicast JSON reply,
//! nothing is retried or acknowledged.  The controller re-probes
//! periodically on its side.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyrec_common::config::Config;
use polyrec_common::discovery::{is_probe, DiscoveryResponse};

/// Bind the discovery port and listen for probes until cancelled.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{}", config.discovery_port);
    let socket = UdpSocket::bind(&bind_addr)
        .await
        .with_context(|| format!("Cannot bind discovery port {bind_addr}"))?;
    info!("Discovery responder listening on {bind_addr}");
    respond(socket, config, cancel).await
}

/// Probe/reply loop over an already-bound socket.
pub async fn respond(
    socket: UdpSocket,
    config: Config,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("Discovery receive error: {e}");
                    continue;
                }
            },
        };

        if !is_probe(&buf[..len]) {
            debug!("Ignoring non-probe datagram from {peer}");
            continue;
        }

        let response = build_response(&config, peer);
        match serde_json::to_vec(&response) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, peer).await {
                    warn!("Cannot answer probe from {peer}: {e}");
                } else {
                    debug!("Answered discovery probe from {peer}");
                }
            }
            Err(e) => warn!("Cannot encode discovery response: {e}"),
        }
    }

    info!("Discovery responder shutting down");
    Ok(())
}

/// Build the identity reply for a probe from `peer`.
fn build_response(config: &Config, peer: SocketAddr) -> DiscoveryResponse {
    DiscoveryResponse {
        device_name: config.device_name.clone(),
        device_id: config.device_id.clone(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        tcp_port: config.command_port,
        udp_streaming_port: config.streaming_port,
        device_capabilities: config.device_capabilities.clone(),
        ip_address: local_ip_toward(peer).to_string(),
    }
}

/// The local address the OS would route toward `peer`, the address the
/// controller should use for the command channel.
fn local_ip_toward(peer: SocketAddr) -> IpAddr {
    // Connecting a throwaway UDP socket selects the outbound interface
    // without sending anything.
    let probe = || -> std::io::Result<IpAddr> {
        let s = std::net::UdpSocket::bind("0.0.0.0:0")?;
        s.connect(peer)?;
        Ok(s.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

// ─── tests ───────────────────────────────────────────────────────────────
