//! Best-effort UDP streaming publisher.
//!
//! Once a controller has opened the command channel, its address is
//! registered here and telemetry packets are pushed to its streaming port.
//! Publish is fire-and-forget: send failures are logged at debug severity
//! and swallowed; telemetry loss is acceptable, capture stalls are not.

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use polyrec_common::protocol::{encode_line, DataPacket};

pub struct StreamingPublisher {
    socket: UdpSocket,
    streaming_port: u16,
    peer: Mutex<Option<SocketAddr>>,
}

impl StreamingPublisher {
    /// Bind an ephemeral local socket for outgoing packets.
    pub async fn new(streaming_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Cannot bind streaming socket")?;
        Ok(Self {
            socket,
            streaming_port,
            peer: Mutex::new(None),
        })
    }

    /// Register the controller that opened the command channel as the
    /// streaming peer.
    pub fn register_peer(&self, ip: IpAddr) {
        let addr = SocketAddr::new(ip, self.streaming_port);
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        if *peer != Some(addr) {
            info!("Streaming peer registered: {addr}");
            *peer = Some(addr);
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push one packet to the registered peer, if any.
    pub async fn publish(&self, packet: &DataPacket) {
        let Some(addr) = self.peer() else {
            return;
        };
        let line = match encode_line(packet) {
            Ok(line) => line,
            Err(e) => {
                debug!("Streaming encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(line.as_bytes(), addr).await {
            debug!("Streaming send to {addr} failed: {e}");
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
