//! Session controller: owns recording state and fans commands out to the
//! capture collaborators.
//!
//! State machine: `Idle → Preparing → Recording → Stopping → Idle`, plus
//! `Error` reachable from any state on an unrecoverable collaborator
//! failure.  At most one session is active at a time; its start timestamp
//! is fixed at creation and never mutated.
//!
//! Acknowledgment timing: the response to StartRecording/StopRecording is
//! produced as soon as the state transition commits; collaborator hardware
//! start/stop runs afterwards via [`SessionController::run_deferred`], so a
//! slow sensor never delays the protocol response.  The command server
//! calls `run_deferred` after writing the response and before reading the
//! next line, which keeps the half-duplex ordering intact.

use std::collections::BTreeMap;

use tracing::{info, warn};

use polyrec_common::protocol::{
    Command, DeviceStatus, ErrorCode, Response, SystemInfo,
};
use polyrec_common::sync::MonotonicClock;

use crate::collaborator::{Collaborator, CollaboratorEvent, Modality};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Recording,
    Stopping,
    Error,
}

/// The active recording session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    /// Device-local monotonic ms; all modality recordings reference it.
    pub start_timestamp: u64,
}

/// Hardware work deferred until after the response line is written.
enum Deferred {
    StartCollaborators,
    StopCollaborators { started: Vec<Modality> },
}

pub struct SessionController {
    state: SessionState,
    session: Option<Session>,
    collaborators: Vec<Box<dyn Collaborator>>,
    /// Modalities whose `start()` succeeded for the active session.
    started: Vec<Modality>,
    deferred: Option<Deferred>,
    clock: MonotonicClock,
    device_id: String,
    session_counter: u64,
}

impl SessionController {
    pub fn new(
        device_id: &str,
        collaborators: Vec<Box<dyn Collaborator>>,
        clock: MonotonicClock,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            session: None,
            collaborators,
            started: Vec::new(),
            deferred: None,
            clock,
            device_id: device_id.to_string(),
            session_counter: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Process one command and produce exactly one response.
    ///
    /// `receive_ms` is the monotonic time the command was read off the
    /// socket (used to stamp sync pongs).
    pub fn handle_command(&mut self, command: Command, receive_ms: u64) -> Response {
        match command {
            Command::StartRecording {
                session_id,
                start_timestamp,
            } => self.start_recording(session_id, start_timestamp),
            Command::StopRecording => self.stop_recording(),
            Command::GetStatus => self.status_update(),
            Command::Prepare => self.prepare(),
            Command::Reset => self.reset(),
            Command::SyncPing {
                ping_id,
                client_send_time,
            } => Response::SyncPong {
                ping_id,
                client_send_time,
                server_receive_time: receive_ms,
                server_send_time: self.clock.now_ms(),
            },
            Command::Unknown { command_type } => Response::ErrorResponse {
                code: ErrorCode::UnknownCommand,
                message: format!("unsupported command type: {command_type}"),
            },
        }
    }

    /// Run hardware work deferred by the last `handle_command`.
    pub fn run_deferred(&mut self) {
        match self.deferred.take() {
            None => {}
            Some(Deferred::StartCollaborators) => self.start_collaborators(),
            Some(Deferred::StopCollaborators { started }) => {
                self.stop_collaborators(&started);
                if self.state == SessionState::Stopping {
                    self.state = SessionState::Idle;
                }
            }
        }
    }

    /// Apply an asynchronous collaborator notification.
    pub fn apply_event(&mut self, event: CollaboratorEvent) {
        if event.fatal {
            warn!(
                "{}: unrecoverable failure ({}), entering Error state",
                event.modality.as_str(),
                event.status
            );
            self.state = SessionState::Error;
        } else {
            info!(
                "{}: {} (connected={})",
                event.modality.as_str(),
                event.status,
                event.connected
            );
        }
    }

    // ── command handlers ─────────────────────────────────────────────

    fn start_recording(
        &mut self,
        session_id: Option<String>,
        start_timestamp: Option<u64>,
    ) -> Response {
        if !matches!(self.state, SessionState::Idle | SessionState::Preparing) {
            return Response::ErrorResponse {
                code: ErrorCode::DeviceBusy,
                message: format!(
                    "cannot start recording in state {:?}",
                    self.state
                ),
            };
        }

        self.session_counter += 1;
        let session_id = session_id.filter(|s| !s.is_empty()).unwrap_or_else(|| {
            format!(
                "{}-{}-s{:04}",
                self.device_id,
                chrono::Utc::now().format("%Y%m%d"),
                self.session_counter
            )
        });
        let start_timestamp = start_timestamp.unwrap_or_else(|| self.clock.now_ms());

        info!("Starting session {session_id} (ts={start_timestamp})");
        self.session = Some(Session {
            session_id: session_id.clone(),
            start_timestamp,
        });
        self.state = SessionState::Recording;
        self.started.clear();
        self.deferred = Some(Deferred::StartCollaborators);

        Response::Acknowledgment {
            command: "StartRecording".to_string(),
            message: format!("starting session {session_id}"),
        }
    }

    fn stop_recording(&mut self) -> Response {
        if self.state != SessionState::Recording {
            return Response::ErrorResponse {
                code: ErrorCode::InvalidState,
                message: format!("cannot stop recording in state {:?}", self.state),
            };
        }

        let session_id = self
            .session
            .take()
            .map(|s| s.session_id)
            .unwrap_or_default();
        info!("Stopping session {session_id}");

        // Stopping until the deferred collaborator stops complete.
        self.state = SessionState::Stopping;
        let started = std::mem::take(&mut self.started);
        self.deferred = Some(Deferred::StopCollaborators { started });

        Response::Acknowledgment {
            command: "StopRecording".to_string(),
            message: format!("stopped session {session_id}"),
        }
    }

    fn prepare(&mut self) -> Response {
        if self.state != SessionState::Idle {
            return Response::ErrorResponse {
                code: ErrorCode::InvalidState,
                message: format!("cannot prepare in state {:?}", self.state),
            };
        }
        self.state = SessionState::Preparing;
        Response::Acknowledgment {
            command: "Prepare".to_string(),
            message: "collaborators ready".to_string(),
        }
    }

    fn reset(&mut self) -> Response {
        info!("Reset requested (state={:?})", self.state);
        self.session = None;
        let started = std::mem::take(&mut self.started);
        if !started.is_empty() {
            self.deferred = Some(Deferred::StopCollaborators { started });
        }
        self.state = SessionState::Idle;
        Response::Acknowledgment {
            command: "Reset".to_string(),
            message: "controller reset to idle".to_string(),
        }
    }

    /// Compose a status update by synchronously polling every
    /// collaborator; a snapshot, not a cached value.  Safe while
    /// Recording.
    fn status_update(&self) -> Response {
        let mut device_status = BTreeMap::new();
        for c in &self.collaborators {
            device_status.insert(
                c.modality().as_str().to_string(),
                DeviceStatus {
                    connected: c.is_connected(),
                    status: c.status(),
                    last_data_timestamp: c.last_data_timestamp(),
                },
            );
        }

        Response::StatusUpdate {
            is_recording: self.is_recording(),
            session_id: self.session.as_ref().map(|s| s.session_id.clone()),
            device_status,
            system_info: SystemInfo {
                battery_percent: None,
                storage_free_bytes: None,
                uptime_secs: self.clock.now_ms() / 1000,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    // ── collaborator fan-out ─────────────────────────────────────────

    /// Start every enabled collaborator for the active session.  A
    /// collaborator that fails to start is excluded from the session and
    /// logged; partial failure never aborts the session.
    fn start_collaborators(&mut self) {
        let Some(session) = self.session.clone() else {
            return; // session was reset before the deferred work ran
        };
        for c in &mut self.collaborators {
            if c.start(&session.session_id, session.start_timestamp) {
                self.started.push(c.modality());
            } else {
                warn!(
                    "{}: failed to start, excluded from session {}",
                    c.modality().as_str(),
                    session.session_id
                );
            }
        }
        info!(
            "Session {} recording with {}/{} modalities",
            session.session_id,
            self.started.len(),
            self.collaborators.len()
        );
    }

    /// Stop every collaborator that was started.  Each stop is attempted;
    /// one failure does not block the others.
    fn stop_collaborators(&mut self, started: &[Modality]) {
        for c in &mut self.collaborators {
            if !started.contains(&c.modality()) {
                continue;
            }
            if !c.stop() {
                warn!("{}: failed to stop cleanly", c.modality().as_str());
            }
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::testing::ScriptedCollaborator;

    fn controller_with(
        collaborators: Vec<Box<dyn Collaborator>>,
    ) -> SessionController {
        SessionController::new("rig", collaborators, MonotonicClock::new())
    }

    fn handle(ctrl: &mut SessionController, cmd: Command) -> Response {
        let resp = ctrl.handle_command(cmd, 0);
        ctrl.run_deferred();
        resp
    }

    fn start(session_id: &str) -> Command {
        Command::StartRecording {
            session_id: Some(session_id.to_string()),
            start_timestamp: Some(1000),
        }
    }

    fn two_scripted() -> Vec<Box<dyn Collaborator>> {
        vec![
            Box::new(ScriptedCollaborator::new(Modality::Camera)),
            Box::new(ScriptedCollaborator::new(Modality::Gsr)),
        ]
    }

    #[test]
    fn test_start_stop_scenario() {
        let mut ctrl = controller_with(two_scripted());

        // Start S1 → Acknowledgment
        let resp = handle(&mut ctrl, start("S1"));
        assert!(matches!(resp, Response::Acknowledgment { ref command, .. }
            if command == "StartRecording"));

        // GetStatus → recording, S1
        match handle(&mut ctrl, Command::GetStatus) {
            Response::StatusUpdate {
                is_recording,
                session_id,
                ..
            } => {
                assert!(is_recording);
                assert_eq!(session_id.as_deref(), Some("S1"));
            }
            other => panic!("expected StatusUpdate, got {other:?}"),
        }

        // Stop → Acknowledgment
        let resp = handle(&mut ctrl, Command::StopRecording);
        assert!(matches!(resp, Response::Acknowledgment { .. }));

        // GetStatus → idle, no session
        match handle(&mut ctrl, Command::GetStatus) {
            Response::StatusUpdate {
                is_recording,
                session_id,
                ..
            } => {
                assert!(!is_recording);
                assert_eq!(session_id, None);
            }
            other => panic!("expected StatusUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_start_while_recording_is_device_busy() {
        let mut ctrl = controller_with(two_scripted());
        handle(&mut ctrl, start("S1"));

        let resp = handle(&mut ctrl, start("S2"));
        assert!(matches!(
            resp,
            Response::ErrorResponse {
                code: ErrorCode::DeviceBusy,
                ..
            }
        ));
        // State unchanged: still recording S1.
        assert!(ctrl.is_recording());
        assert_eq!(ctrl.session().unwrap().session_id, "S1");
        assert_eq!(ctrl.session().unwrap().start_timestamp, 1000);
    }

    #[test]
    fn test_stop_while_idle_is_invalid_state() {
        let mut ctrl = controller_with(two_scripted());
        let resp = handle(&mut ctrl, Command::StopRecording);
        assert!(matches!(
            resp,
            Response::ErrorResponse {
                code: ErrorCode::InvalidState,
                ..
            }
        ));
        assert_eq!(ctrl.state(), SessionState::Idle);
    }

    #[test]
    fn test_failed_collaborator_is_excluded_not_fatal() {
        let mut ctrl = controller_with(vec![
            Box::new(ScriptedCollaborator::new(Modality::Camera)),
            Box::new(ScriptedCollaborator::failing_start(Modality::Thermal)),
        ]);

        let resp = handle(&mut ctrl, start("S1"));
        assert!(matches!(resp, Response::Acknowledgment { .. }));
        assert!(ctrl.is_recording());

        match handle(&mut ctrl, Command::GetStatus) {
            Response::StatusUpdate { device_status, .. } => {
                assert!(device_status["camera"].connected);
                assert!(!device_status["thermal"].connected);
            }
            other => panic!("expected StatusUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_attempts_every_started_collaborator() {
        let mut failing_stop = ScriptedCollaborator::new(Modality::Camera);
        failing_stop.fail_stop = true;

        let mut ctrl = controller_with(vec![
            Box::new(failing_stop),
            Box::new(ScriptedCollaborator::new(Modality::Gsr)),
        ]);
        handle(&mut ctrl, start("S1"));
        let resp = handle(&mut ctrl, Command::StopRecording);

        // The camera stop failure does not fail the command or skip gsr.
        assert!(matches!(resp, Response::Acknowledgment { .. }));
        assert_eq!(ctrl.state(), SessionState::Idle);
    }

    #[test]
    fn test_generated_session_ids_are_unique() {
        let mut ctrl = controller_with(two_scripted());

        let begin = Command::StartRecording {
            session_id: None,
            start_timestamp: None,
        };
        handle(&mut ctrl, begin.clone());
        let first = ctrl.session().unwrap().session_id.clone();
        handle(&mut ctrl, Command::StopRecording);

        handle(&mut ctrl, begin);
        let second = ctrl.session().unwrap().session_id.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn test_sync_ping_is_stamped() {
        let mut ctrl = controller_with(vec![]);
        match handle(
            &mut ctrl,
            Command::SyncPing {
                ping_id: 9,
                client_send_time: 123,
            },
        ) {
            Response::SyncPong {
                ping_id,
                client_send_time,
                server_receive_time,
                server_send_time,
            } => {
                assert_eq!(ping_id, 9);
                assert_eq!(client_send_time, 123);
                assert!(server_send_time >= server_receive_time);
            }
            other => panic!("expected SyncPong, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_response() {
        let mut ctrl = controller_with(vec![]);
        let resp = handle(
            &mut ctrl,
            Command::Unknown {
                command_type: "CalibrateLens".to_string(),
            },
        );
        assert!(matches!(
            resp,
            Response::ErrorResponse {
                code: ErrorCode::UnknownCommand,
                ..
            }
        ));
    }

    #[test]
    fn test_prepare_then_start_then_reset() {
        let mut ctrl = controller_with(two_scripted());
        assert!(matches!(
            handle(&mut ctrl, Command::Prepare),
            Response::Acknowledgment { .. }
        ));
        assert_eq!(ctrl.state(), SessionState::Preparing);

        handle(&mut ctrl, start("S1"));
        assert!(ctrl.is_recording());

        handle(&mut ctrl, Command::Reset);
        assert_eq!(ctrl.state(), SessionState::Idle);
        assert!(ctrl.session().is_none());
    }

    #[test]
    fn test_fatal_event_enters_error_state_and_reset_recovers() {
        let mut ctrl = controller_with(two_scripted());
        ctrl.apply_event(CollaboratorEvent {
            modality: Modality::Gsr,
            connected: false,
            status: "bus failure".to_string(),
            fatal: true,
        });
        assert_eq!(ctrl.state(), SessionState::Error);

        // Commands are rejected cleanly while in Error...
        assert!(matches!(
            handle(&mut ctrl, start("S1")),
            Response::ErrorResponse {
                code: ErrorCode::DeviceBusy,
                ..
            }
        ));

        // ...and Reset recovers.
        handle(&mut ctrl, Command::Reset);
        assert_eq!(ctrl.state(), SessionState::Idle);
        assert!(matches!(
            handle(&mut ctrl, start("S1")),
            Response::Acknowledgment { .. }
        ));
    }
}
