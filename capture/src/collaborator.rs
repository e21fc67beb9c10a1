//! Capture collaborator contract.
//!
//! The actual sensor drivers (camera pipeline, thermal decoder, GSR device,
//! audio encoder) live outside this subsystem; the session controller only
//! drives their start/stop/status contract.  Collaborators report
//! asynchronous state changes over an event channel the session controller
//! drains on its own task; no callbacks fired from driver threads into
//! shared state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use polyrec_common::protocol::DataPacket;
use polyrec_common::sync::MonotonicClock;

use crate::streaming::StreamingPublisher;

/// The four capture modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Camera,
    Thermal,
    Gsr,
    Audio,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Camera,
        Modality::Thermal,
        Modality::Gsr,
        Modality::Audio,
    ];

    /// Wire name used as the `deviceStatus` map key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Thermal => "thermal",
            Self::Gsr => "gsr",
            Self::Audio => "audio",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "camera" => Some(Self::Camera),
            "thermal" => Some(Self::Thermal),
            "gsr" => Some(Self::Gsr),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Asynchronous state-change notification from a collaborator.
#[derive(Debug, Clone)]
pub struct CollaboratorEvent {
    pub modality: Modality,
    pub connected: bool,
    pub status: String,
    /// Unrecoverable failure; drives the session controller to Error.
    pub fatal: bool,
}

/// Contract every capture collaborator implements.
///
/// `start`/`stop` return `false` on failure rather than erroring; a
/// collaborator that cannot start is excluded from the session, never
/// aborting it.
pub trait Collaborator: Send {
    fn modality(&self) -> Modality;
    fn start(&mut self, session_id: &str, start_timestamp: u64) -> bool;
    fn stop(&mut self) -> bool;
    fn is_connected(&self) -> bool;
    /// Short state label, e.g. `idle` / `recording`.
    fn status(&self) -> String;
    /// Device-local monotonic ms of the most recent sample, if any.
    fn last_data_timestamp(&self) -> Option<u64> {
        None
    }
    fn set_event_sender(&mut self, _tx: mpsc::UnboundedSender<CollaboratorEvent>) {}
}

// ── driver-boundary stub ─────────────────────────────────────────────────

/// Stand-in for a real sensor driver: honors the contract and synthesizes
/// telemetry through the streaming publisher while a session is active.
pub struct SimulatedCollaborator {
    modality: Modality,
    device_id: String,
    publisher: Arc<StreamingPublisher>,
    clock: MonotonicClock,
    sample_interval: Duration,
    running: Arc<AtomicBool>,
    last_data: Arc<AtomicU64>,
    events: Option<mpsc::UnboundedSender<CollaboratorEvent>>,
}

impl SimulatedCollaborator {
    pub fn new(
        modality: Modality,
        device_id: &str,
        publisher: Arc<StreamingPublisher>,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            modality,
            device_id: device_id.to_string(),
            publisher,
            clock,
            sample_interval: Duration::from_millis(500),
            running: Arc::new(AtomicBool::new(false)),
            last_data: Arc::new(AtomicU64::new(0)),
            events: None,
        }
    }

    fn emit(&self, connected: bool, status: &str) {
        if let Some(tx) = &self.events {
            let _ = tx.send(CollaboratorEvent {
                modality: self.modality,
                connected,
                status: status.to_string(),
                fatal: false,
            });
        }
    }
}

impl Collaborator for SimulatedCollaborator {
    fn modality(&self) -> Modality {
        self.modality
    }

    fn start(&mut self, session_id: &str, start_timestamp: u64) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("{}: start while already running", self.modality.as_str());
            return false;
        }
        debug!(
            "{}: starting (session={}, ts={})",
            self.modality.as_str(),
            session_id,
            start_timestamp
        );

        let modality = self.modality;
        let device_id = self.device_id.clone();
        let publisher = Arc::clone(&self.publisher);
        let clock = self.clock.clone();
        let running = Arc::clone(&self.running);
        let last_data = Arc::clone(&self.last_data);
        let interval = self.sample_interval;

        // Telemetry loop; stops when the running flag clears.
        tokio::spawn(async move {
            let mut seq = 0u64;
            while running.load(Ordering::SeqCst) {
                let now = clock.now_ms();
                last_data.store(now, Ordering::SeqCst);
                let packet = DataPacket {
                    device_id: device_id.clone(),
                    modality: modality.as_str().to_string(),
                    seq,
                    timestamp: now,
                    payload: serde_json::json!({ "sample": seq }),
                };
                publisher.publish(&packet).await;
                seq += 1;
                tokio::time::sleep(interval).await;
            }
            debug!("{}: telemetry loop ended", modality.as_str());
        });

        self.emit(true, "recording");
        true
    }

    fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        self.emit(true, "idle");
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn status(&self) -> String {
        if self.running.load(Ordering::SeqCst) {
            "recording".to_string()
        } else {
            "idle".to_string()
        }
    }

    fn last_data_timestamp(&self) -> Option<u64> {
        match self.last_data.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    fn set_event_sender(&mut self, tx: mpsc::UnboundedSender<CollaboratorEvent>) {
        self.events = Some(tx);
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Scriptable collaborator for session-controller tests.
    pub struct ScriptedCollaborator {
        pub modality: Modality,
        pub fail_start: bool,
        pub fail_stop: bool,
        pub connected: bool,
        pub started: bool,
        pub start_calls: usize,
        pub stop_calls: usize,
    }

    impl ScriptedCollaborator {
        pub fn new(modality: Modality) -> Self {
            Self {
                modality,
                fail_start: false,
                fail_stop: false,
                connected: true,
                started: false,
                start_calls: 0,
                stop_calls: 0,
            }
        }

        pub fn failing_start(modality: Modality) -> Self {
            Self {
                fail_start: true,
                connected: false,
                ..Self::new(modality)
            }
        }
    }

    impl Collaborator for ScriptedCollaborator {
        fn modality(&self) -> Modality {
            self.modality
        }

        fn start(&mut self, _session_id: &str, _start_timestamp: u64) -> bool {
            self.start_calls += 1;
            if self.fail_start {
                return false;
            }
            self.started = true;
            true
        }

        fn stop(&mut self) -> bool {
            self.stop_calls += 1;
            self.started = false;
            !self.fail_stop
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn status(&self) -> String {
            if self.started { "recording".into() } else { "idle".into() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_names_round_trip() {
        for m in Modality::ALL {
            assert_eq!(Modality::from_name(m.as_str()), Some(m));
        }
        assert_eq!(Modality::from_name("lidar"), None);
    }
}
