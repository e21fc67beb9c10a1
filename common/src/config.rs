//! Configuration parsing – reads a KEY=VALUE file (`polyrec.conf`).
//!
//! Both binaries load the same file; each ignores fields it does not need.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

/// Application configuration, shared between the capture device and the
/// controller.
#[derive(Debug, Clone)]
pub struct Config {
    // ── identity (capture) ───────────────────────────────────────────
    pub device_name: String,
    /// Stable identifier; derived from `device_name` when not configured.
    pub device_id: String,
    /// Enabled capture modalities, e.g. `camera,thermal,gsr,audio`.
    pub device_capabilities: Vec<String>,

    // ── ports ────────────────────────────────────────────────────────
    pub discovery_port: u16,
    pub command_port: u16,
    pub streaming_port: u16,

    // ── discovery / liveness (controller) ────────────────────────────
    pub discovery_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub enable_mdns: bool,

    // ── connections (controller) ─────────────────────────────────────
    pub connect_timeout_secs: u64,
    pub auto_connect: bool,
    pub status_poll_secs: u64,

    // ── clock sync ───────────────────────────────────────────────────
    pub sync_interval_secs: u64,
    pub sync_rtt_limit_ms: u64,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/polyrec/polyrec.conf"
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_str(&text);
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`Config`] from file contents, applying defaults per key.
pub fn from_str(text: &str) -> Config {
    let map = parse_conf(text);

    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u16 = |key: &str, default: u16| -> u16 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str, default: bool| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    };

    let device_name = get("DEVICE_NAME").unwrap_or_else(|| "polyrec-device".into());
    let device_id = get("DEVICE_ID")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| slugify(&device_name));

    let device_capabilities: Vec<String> = get("DEVICE_CAPABILITIES")
        .unwrap_or_else(|| "camera,thermal,gsr,audio".into())
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    Config {
        device_name,
        device_id,
        device_capabilities,

        discovery_port: get_u16("DISCOVERY_PORT", crate::discovery::DEFAULT_DISCOVERY_PORT),
        command_port: get_u16("COMMAND_PORT", crate::discovery::DEFAULT_COMMAND_PORT),
        streaming_port: get_u16("STREAMING_PORT", crate::discovery::DEFAULT_STREAMING_PORT),

        discovery_interval_secs: get_u64("DISCOVERY_INTERVAL_SECS", 3),
        liveness_timeout_secs: get_u64("LIVENESS_TIMEOUT_SECS", 30),
        sweep_interval_secs: get_u64("SWEEP_INTERVAL_SECS", 10),
        enable_mdns: get_bool("ENABLE_MDNS", true),

        connect_timeout_secs: get_u64("CONNECT_TIMEOUT_SECS", 10),
        auto_connect: get_bool("AUTO_CONNECT", true),
        status_poll_secs: get_u64("STATUS_POLL_SECS", 5),

        sync_interval_secs: get_u64("SYNC_INTERVAL_SECS", 1),
        sync_rtt_limit_ms: get_u64("SYNC_RTT_LIMIT_MS", 250),
    }
}

/// Lowercase, spaces to dashes: a stable id from a display name.
fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect()
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
DEVICE_NAME="Lab Rig 1"
COMMAND_PORT=9001
DEVICE_CAPABILITIES="camera, gsr"
"#;
        let map = parse_conf(text);
        assert_eq!(map["DEVICE_NAME"], "Lab Rig 1");
        assert_eq!(map["COMMAND_PORT"], "9001");
    }

    #[test]
    fn test_defaults_apply() {
        let config = from_str("");
        assert_eq!(config.device_name, "polyrec-device");
        assert_eq!(config.device_id, "polyrec-device");
        assert_eq!(config.command_port, 8831);
        assert_eq!(config.liveness_timeout_secs, 30);
        assert_eq!(config.sweep_interval_secs, 10);
        assert_eq!(config.sync_interval_secs, 1);
        assert!(config.auto_connect);
        assert_eq!(
            config.device_capabilities,
            vec!["camera", "thermal", "gsr", "audio"]
        );
    }

    #[test]
    fn test_device_id_derived_from_name() {
        let config = from_str("DEVICE_NAME=\"Lab Rig 1\"\n");
        assert_eq!(config.device_id, "lab-rig-1");

        let config = from_str("DEVICE_NAME=rig\nDEVICE_ID=rig-override\n");
        assert_eq!(config.device_id, "rig-override");
    }

    #[test]
    fn test_capability_list_parsing() {
        let config = from_str("DEVICE_CAPABILITIES=\"camera, gsr,,\"\n");
        assert_eq!(config.device_capabilities, vec!["camera", "gsr"]);
    }
}
