//! Discovery protocol shapes shared by the capture device and controller.
//!
//! The controller broadcasts a fixed plaintext probe on the discovery UDP
//! port; every capture device answers unicast with a JSON
//! [`DiscoveryResponse`] describing its identity and ports.  Discovery is
//! stateless and best-effort: no ordering, no delivery guarantee, no
//! acknowledgment; the controller simply re-probes periodically.

use serde::{Deserialize, Serialize};

/// Plaintext sentinel the controller broadcasts.
pub const DISCOVERY_PROBE: &str = "DISCOVER_POLYREC_APP";

/// Default UDP port the capture device listens on for probes.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8830;
/// Default TCP port for the command channel.
pub const DEFAULT_COMMAND_PORT: u16 = 8831;
/// Default UDP port the controller receives streaming packets on.
pub const DEFAULT_STREAMING_PORT: u16 = 8832;

/// Unicast reply to a discovery probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    pub device_name: String,
    pub device_id: String,
    pub app_version: String,
    pub tcp_port: u16,
    pub udp_streaming_port: u16,
    pub device_capabilities: Vec<String>,
    pub ip_address: String,
}

/// Whether a received datagram is the discovery probe.
pub fn is_probe(datagram: &[u8]) -> bool {
    // Tolerate a trailing newline from hand-typed probes (netcat testing).
    std::str::from_utf8(datagram)
        .map(|s| s.trim_end() == DISCOVERY_PROBE)
        .unwrap_or(false)
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_probe() {
        assert!(is_probe(DISCOVERY_PROBE.as_bytes()));
        assert!(is_probe(b"DISCOVER_POLYREC_APP\n"));
        assert!(!is_probe(b"DISCOVER_OTHER_APP"));
        assert!(!is_probe(&[0xff, 0xfe]));
    }

    #[test]
    fn test_discovery_response_wire_shape() {
        let resp = DiscoveryResponse {
            device_name: "lab-rig-1".to_string(),
            device_id: "lab-rig-1".to_string(),
            app_version: "0.1.0".to_string(),
            tcp_port: DEFAULT_COMMAND_PORT,
            udp_streaming_port: DEFAULT_STREAMING_PORT,
            device_capabilities: vec!["camera".to_string(), "gsr".to_string()],
            ip_address: "192.168.1.20".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"deviceName\":\"lab-rig-1\""));
        assert!(json.contains("\"tcpPort\":8831"));
        assert!(json.contains("\"udpStreamingPort\":8832"));
        assert!(json.contains("\"deviceCapabilities\":[\"camera\",\"gsr\"]"));

        let back: DiscoveryResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
