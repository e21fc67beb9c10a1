//! Wire protocol for the command channel between controller and capture
//! device.
//!
//! Messages are newline-delimited JSON, one message per line, tagged with a
//! `type` field.  Every command produces exactly one response on the same
//! connection, in order; the protocol is strictly half-duplex.
//!
//! Decoding never panics on malformed input: garbage yields a typed
//! [`DecodeError`] so the server can answer `INVALID_FORMAT` instead of
//! dropping the connection, and a well-formed message with an unknown
//! `type` decodes to [`Command::Unknown`] so newer peers are answered with
//! `UNKNOWN_COMMAND` rather than disconnected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A command sent from the controller to the capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Command {
    /// Begin a recording session.  When `session_id` is omitted the device
    /// generates one; `start_timestamp` is the controller's monotonic
    /// millisecond clock at issue time.
    StartRecording {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_timestamp: Option<u64>,
    },
    StopRecording,
    GetStatus,
    /// Ready the capture collaborators without starting a session.
    Prepare,
    /// Force the session controller back to Idle from any state.
    Reset,
    /// Clock-sync probe; answered with [`Response::SyncPong`].
    SyncPing { ping_id: u64, client_send_time: u64 },
    /// A well-formed message whose `type` we do not implement.  Never
    /// encoded by this crate; produced only by [`decode_command`].
    Unknown { command_type: String },
}

impl Command {
    /// Short name echoed back in acknowledgments.
    pub fn name(&self) -> &str {
        match self {
            Self::StartRecording { .. } => "StartRecording",
            Self::StopRecording => "StopRecording",
            Self::GetStatus => "GetStatus",
            Self::Prepare => "Prepare",
            Self::Reset => "Reset",
            Self::SyncPing { .. } => "SyncPing",
            Self::Unknown { command_type } => command_type,
        }
    }
}

/// A response from the capture device to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Response {
    Acknowledgment {
        command: String,
        message: String,
    },
    ErrorResponse {
        code: ErrorCode,
        message: String,
    },
    StatusUpdate {
        is_recording: bool,
        /// `null` when no session is active.
        session_id: Option<String>,
        /// Per-modality snapshot keyed by modality name.
        device_status: BTreeMap<String, DeviceStatus>,
        system_info: SystemInfo,
    },
    SyncPong {
        ping_id: u64,
        client_send_time: u64,
        server_receive_time: u64,
        server_send_time: u64,
    },
}

/// Protocol error codes (wire strings, e.g. `DEVICE_BUSY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownCommand,
    InvalidState,
    DeviceBusy,
    InternalError,
    InvalidFormat,
}

/// Snapshot of one capture modality, taken synchronously at status time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_timestamp: Option<u64>,
}

/// Device-level information attached to every status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_free_bytes: Option<u64>,
    pub uptime_secs: u64,
    pub app_version: String,
}

/// Best-effort telemetry sample pushed over the UDP streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPacket {
    pub device_id: String,
    pub modality: String,
    pub seq: u64,
    /// Device-local monotonic milliseconds.
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

// ── codec ────────────────────────────────────────────────────────────────

/// Failure to decode an incoming line.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no string \"type\" field")]
    MissingType,
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
}

/// Failure to encode an outgoing message.
#[derive(Debug, Error)]
#[error("cannot encode message: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

const COMMAND_TYPES: &[&str] = &[
    "StartRecording",
    "StopRecording",
    "GetStatus",
    "Prepare",
    "Reset",
    "SyncPing",
];

const RESPONSE_TYPES: &[&str] = &[
    "Acknowledgment",
    "ErrorResponse",
    "StatusUpdate",
    "SyncPong",
];

/// Encode a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, EncodeError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse a line far enough to extract its `type` tag.
fn parse_tagged(line: &str) -> Result<(String, serde_json::Value), DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }
    let value: serde_json::Value = serde_json::from_str(line)?;
    let tag = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    Ok((tag, value))
}

/// Decode a command line.  Unknown `type` tags yield [`Command::Unknown`]
/// instead of failing, so the caller can answer `UNKNOWN_COMMAND`.
pub fn decode_command(line: &str) -> Result<Command, DecodeError> {
    let (tag, value) = parse_tagged(line)?;
    if COMMAND_TYPES.contains(&tag.as_str()) {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(Command::Unknown { command_type: tag })
    }
}

/// Decode a response line.
pub fn decode_response(line: &str) -> Result<Response, DecodeError> {
    let (tag, value) = parse_tagged(line)?;
    if RESPONSE_TYPES.contains(&tag.as_str()) {
        Ok(serde_json::from_value(value)?)
    } else {
        Err(DecodeError::UnknownType(tag))
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
