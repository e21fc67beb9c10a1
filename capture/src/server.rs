//! TCP command server: the reliable channel the controller drives the
//! session over.
//!
//! One newline-delimited JSON message per line; every command is answered
//! with exactly one response, in order.  Malformed lines are answered with
//! `INVALID_FORMAT` and the connection stays open.  A transport failure
//! ends the connection but never the session; a reconnecting controller
//! recovers session awareness via GetStatus.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyrec_common::protocol::{
    decode_command, encode_line, DecodeError, ErrorCode, Response,
};
use polyrec_common::sync::MonotonicClock;

use crate::session::SessionController;
use crate::streaming::StreamingPublisher;

/// Bind the command port and serve until cancelled.
pub async fn run(
    listen_addr: &str,
    controller: Arc<Mutex<SessionController>>,
    publisher: Arc<StreamingPublisher>,
    clock: MonotonicClock,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Cannot bind command port {listen_addr}"))?;
    info!("Command server listening on {listen_addr}");
    serve(listener, controller, publisher, clock, cancel).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    controller: Arc<Mutex<SessionController>>,
    publisher: Arc<StreamingPublisher>,
    clock: MonotonicClock,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted.context("Accept failed")?,
        };

        info!("Controller connected from {peer}");
        let controller = Arc::clone(&controller);
        let publisher = Arc::clone(&publisher);
        let clock = clock.clone();
        let conn_cancel = cancel.child_token();

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, controller, publisher, clock, conn_cancel)
                    .await
            {
                debug!("Connection {peer} ended with error: {e}");
            }
            info!("Controller {peer} disconnected");
        });
    }

    info!("Command server shutting down");
    Ok(())
}

/// Serve one controller connection until EOF, error or cancellation.
///
/// Cancellation is checked between commands, so an in-flight response is
/// always drained before the socket closes.
async fn handle_connection(
    stream: TcpStream,
    controller: Arc<Mutex<SessionController>>,
    publisher: Arc<StreamingPublisher>,
    clock: MonotonicClock,
    cancel: CancellationToken,
) -> Result<()> {
    let peer = stream.peer_addr().context("Peer address unavailable")?;

    // A connected controller is the streaming peer from here on.
    publisher.register_peer(peer.ip());

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            break; // EOF
        }
        if line.trim().is_empty() {
            continue;
        }
        let receive_ms = clock.now_ms();

        match decode_command(&line) {
            Ok(command) => {
                debug!("← {}", command.name());
                // The lock is held across the write so the response and the
                // deferred hardware work of one command always pair up,
                // even with multiple controllers connected.
                let mut ctrl = controller.lock().await;
                let response = ctrl.handle_command(command, receive_ms);
                write_response(&mut write_half, &response).await?;
                ctrl.run_deferred();
            }
            Err(e @ DecodeError::Empty) => {
                debug!("Ignoring blank message: {e}");
            }
            Err(e) => {
                warn!("Malformed command from {peer}: {e}");
                let response = Response::ErrorResponse {
                    code: ErrorCode::InvalidFormat,
                    message: e.to_string(),
                };
                write_response(&mut write_half, &response).await?;
            }
        }
    }

    Ok(())
}

async fn write_response(
    write_half: &mut OwnedWriteHalf,
    response: &Response,
) -> Result<()> {
    let line = encode_line(response).context("Cannot encode response")?;
    write_half
        .write_all(line.as_bytes())
        .await
        .context("Cannot write response")?;
    write_half.flush().await.context("Cannot flush response")?;
    Ok(())
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::testing::ScriptedCollaborator;
    use crate::collaborator::{Collaborator, Modality};
    use polyrec_common::protocol::decode_response;

    struct TestHarness {
        stream: BufReader<TcpStream>,
        cancel: CancellationToken,
    }

    impl TestHarness {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let clock = MonotonicClock::new();
            let collaborators: Vec<Box<dyn Collaborator>> = vec![
                Box::new(ScriptedCollaborator::new(Modality::Camera)),
                Box::new(ScriptedCollaborator::failing_start(Modality::Thermal)),
            ];
            let controller = Arc::new(Mutex::new(SessionController::new(
                "rig",
                collaborators,
                clock.clone(),
            )));
            let publisher = Arc::new(StreamingPublisher::new(0).await.unwrap());

            let cancel = CancellationToken::new();
            tokio::spawn(serve(
                listener,
                controller,
                publisher,
                clock,
                cancel.clone(),
            ));

            let stream = TcpStream::connect(addr).await.unwrap();
            Self {
                stream: BufReader::new(stream),
                cancel,
            }
        }

        async fn round_trip(&mut self, request: &str) -> Response {
            self.stream
                .get_mut()
                .write_all(format!("{request}\n").as_bytes())
                .await
                .unwrap();
            let mut line = String::new();
            tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.stream.read_line(&mut line),
            )
            .await
            .expect("response timed out")
            .unwrap();
            decode_response(&line).unwrap()
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[tokio::test]
    async fn test_command_session_end_to_end() {
        let mut h = TestHarness::start().await;

        let resp = h
            .round_trip("{\"type\":\"StartRecording\",\"sessionId\":\"S1\"}")
            .await;
        assert!(matches!(resp, Response::Acknowledgment { ref command, .. }
            if command == "StartRecording"));

        match h.round_trip("{\"type\":\"GetStatus\"}").await {
            Response::StatusUpdate {
                is_recording,
                session_id,
                device_status,
                ..
            } => {
                assert!(is_recording);
                assert_eq!(session_id.as_deref(), Some("S1"));
                // The failing thermal collaborator is reported, not fatal.
                assert!(device_status["camera"].connected);
                assert!(!device_status["thermal"].connected);
            }
            other => panic!("expected StatusUpdate, got {other:?}"),
        }

        let resp = h.round_trip("{\"type\":\"StopRecording\"}").await;
        assert!(matches!(resp, Response::Acknowledgment { .. }));

        match h.round_trip("{\"type\":\"GetStatus\"}").await {
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

    #[tokio::test]
    async fn test_malformed_line_keeps_connection_open() {
        let mut h = TestHarness::start().await;

        let resp = h.round_trip("this is not json").await;
        assert!(matches!(
            resp,
            Response::ErrorResponse {
                code: ErrorCode::InvalidFormat,
                ..
            }
        ));

        // The connection still works afterwards.
        let resp = h.round_trip("{\"type\":\"GetStatus\"}").await;
        assert!(matches!(resp, Response::StatusUpdate { .. }));
    }

    #[tokio::test]
    async fn test_unknown_command_type() {
        let mut h = TestHarness::start().await;
        let resp = h.round_trip("{\"type\":\"CalibrateLens\"}").await;
        assert!(matches!(
            resp,
            Response::ErrorResponse {
                code: ErrorCode::UnknownCommand,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sync_ping_pong() {
        let mut h = TestHarness::start().await;
        let resp = h
            .round_trip("{\"type\":\"SyncPing\",\"pingId\":1,\"clientSendTime\":5}")
            .await;
        match resp {
            Response::SyncPong {
                ping_id,
                client_send_time,
                server_receive_time,
                server_send_time,
            } => {
                assert_eq!(ping_id, 1);
                assert_eq!(client_send_time, 5);
                assert!(server_send_time >= server_receive_time);
            }
            other => panic!("expected SyncPong, got {other:?}"),
        }
    }
}
