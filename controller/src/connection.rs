//! One TCP command connection to one capture device.
//!
//! The channel is half-duplex: a single command may be in flight at a
//! time, and the next send is refused with [`ConnectionError::Busy`]
//! until the device's reply (or the connection's death) clears the slot.
//! A background receive loop mirrors the device's reported state into
//! [`DeviceState`] and feeds SyncPong stamps into the clock-offset
//! estimator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyrec_common::protocol::{
    encode_line, Command, ErrorCode, Response,
};
use polyrec_common::sync::{compute_sample, MonotonicClock, OffsetEstimator};

/// Sliding window of retained sync samples per device.
const SYNC_WINDOW: usize = 30;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection attempt to {addr} timed out after {secs}s")]
    ConnectTimeout { addr: SocketAddr, secs: u64 },
    #[error("A command is already awaiting its response")]
    Busy,
    #[error("Not connected")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] polyrec_common::protocol::EncodeError),
}

/// Mirror of a device's last reported state.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub is_recording: bool,
    pub session_id: Option<String>,
    pub battery_percent: Option<u8>,
    pub storage_free_bytes: Option<u64>,
    pub clock_offset_ms: Option<f64>,
}

/// Notifications pushed by the receive loop.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { device_id: String },
    Acknowledged { device_id: String, command: String, message: String },
    Rejected { device_id: String, code: ErrorCode, message: String },
    Status { device_id: String, state: DeviceState },
    SyncUpdated { device_id: String, offset_ms: f64, rtt_ms: f64 },
    Disconnected { device_id: String },
}

pub struct DeviceConnection {
    device_id: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    in_flight: AtomicBool,
    disconnected: AtomicBool,
    state: StdMutex<DeviceState>,
    estimator: StdMutex<OffsetEstimator>,
    clock: MonotonicClock,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl DeviceConnection {
    /// Connect to a device's command port.  The attempt is bounded by
    /// `connect_timeout`; on success a receive loop is spawned and a
    /// `Connected` event is emitted.
    pub async fn connect(
        device_id: &str,
        addr: SocketAddr,
        connect_timeout: Duration,
        sync_rtt_limit_ms: f64,
        clock: MonotonicClock,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout {
                addr,
                secs: connect_timeout.as_secs(),
            })??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let conn = Arc::new(Self {
            device_id: device_id.to_string(),
            writer: Mutex::new(Some(writer)),
            in_flight: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            state: StdMutex::new(DeviceState::default()),
            estimator: StdMutex::new(OffsetEstimator::new(SYNC_WINDOW, sync_rtt_limit_ms)),
            clock,
            events,
            cancel: CancellationToken::new(),
        });

        info!("Connected to {} at {}", device_id, addr);
        let _ = conn.events.send(ConnectionEvent::Connected {
            device_id: conn.device_id.clone(),
        });
        tokio::spawn(Arc::clone(&conn).receive_loop(BufReader::new(reader)));
        Ok(conn)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    /// True while a command is awaiting its reply.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DeviceState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clock_offset_ms(&self) -> Option<f64> {
        self.estimator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .offset_ms()
    }

    /// Send one command.  Refused with `Busy` while a previous command is
    /// still awaiting its reply.
    pub async fn send_command(&self, command: &Command) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConnectionError::Busy);
        }

        let line = encode_line(command)?;
        let mut writer = self.writer.lock().await;
        let result = match writer.as_mut() {
            Some(w) => w.write_all(line.as_bytes()).await.map_err(Into::into),
            None => Err(ConnectionError::NotConnected),
        };
        drop(writer);

        if result.is_err() {
            // The slot must not stay occupied for a command that never
            // reached the wire.
            self.in_flight.store(false, Ordering::SeqCst);
        } else {
            debug!("{}: sent {}", self.device_id, command.name());
        }
        result
    }

    /// Close the connection.  Safe to call more than once; later calls
    /// are no-ops.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
        drop(writer);
        self.finish_disconnect();
    }

    fn finish_disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.in_flight.store(false, Ordering::SeqCst);
        info!("Disconnected from {}", self.device_id);
        let _ = self.events.send(ConnectionEvent::Disconnected {
            device_id: self.device_id.clone(),
        });
    }

    async fn receive_loop(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>) {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = reader.read_line(&mut line) => r,
            };
            match read {
                Ok(0) => {
                    debug!("{}: device closed the connection", self.device_id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{}: read error: {e}", self.device_id);
                    break;
                }
            }
            match polyrec_common::protocol::decode_response(&line) {
                Ok(response) => self.handle_response(response),
                Err(polyrec_common::protocol::DecodeError::Empty) => {}
                Err(e) => warn!("{}: undecodable reply: {e}", self.device_id),
            }
        }
        self.finish_disconnect();
    }

    fn handle_response(&self, response: Response) {
        // Every reply, whatever its shape, frees the command slot.
        self.in_flight.store(false, Ordering::SeqCst);

        match response {
            Response::Acknowledgment { command, message } => {
                debug!("{}: ack for {command}", self.device_id);
                let _ = self.events.send(ConnectionEvent::Acknowledged {
                    device_id: self.device_id.clone(),
                    command,
                    message,
                });
            }
            Response::ErrorResponse { code, message } => {
                warn!("{}: rejected ({code:?}): {message}", self.device_id);
                let _ = self.events.send(ConnectionEvent::Rejected {
                    device_id: self.device_id.clone(),
                    code,
                    message,
                });
            }
            Response::StatusUpdate {
                is_recording,
                session_id,
                device_status: _,
                system_info,
            } => {
                let snapshot = {
                    let mut state =
                        self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.is_recording = is_recording;
                    state.session_id = session_id;
                    state.battery_percent = system_info.battery_percent;
                    state.storage_free_bytes = system_info.storage_free_bytes;
                    state.clone()
                };
                let _ = self.events.send(ConnectionEvent::Status {
                    device_id: self.device_id.clone(),
                    state: snapshot,
                });
            }
            Response::SyncPong {
                ping_id,
                client_send_time,
                server_receive_time,
                server_send_time,
            } => {
                let client_receive = self.clock.now_ms();
                let sample = compute_sample(
                    client_send_time,
                    server_receive_time,
                    server_send_time,
                    client_receive,
                );
                let mut estimator =
                    self.estimator.lock().unwrap_or_else(|e| e.into_inner());
                if estimator.add_sample(sample) {
                    let offset = estimator.offset_ms().unwrap_or(sample.offset_ms);
                    drop(estimator);
                    self.state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clock_offset_ms = Some(offset);
                    let _ = self.events.send(ConnectionEvent::SyncUpdated {
                        device_id: self.device_id.clone(),
                        offset_ms: offset,
                        rtt_ms: sample.rtt_ms,
                    });
                } else {
                    debug!(
                        "{}: sync sample #{ping_id} dropped (rtt {:.1}ms)",
                        self.device_id, sample.rtt_ms
                    );
                }
            }
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
