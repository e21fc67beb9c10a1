//! Periodic clock-sync pinger, one task per connected device.
//!
//! Sends a SyncPing roughly once per second.  Ticks are skipped while the
//! command channel is busy or the device is recording; sync traffic must
//! never displace a control command, and an active session already has its
//! reference offset.  The pong side lives in the connection's receive
//! loop, which feeds the offset estimator.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use polyrec_common::protocol::Command;
use polyrec_common::sync::MonotonicClock;

use crate::connection::{ConnectionError, DeviceConnection};

pub async fn run_sync_loop(
    conn: Arc<DeviceConnection>,
    clock: MonotonicClock,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    let mut ping_id: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if !conn.is_connected() {
            break;
        }
        if conn.is_busy() || conn.state().is_recording {
            debug!("{}: skipping sync tick", conn.device_id());
            continue;
        }

        ping_id += 1;
        let ping = Command::SyncPing {
            ping_id,
            client_send_time: clock.now_ms(),
        };
        match conn.send_command(&ping).await {
            Ok(()) => {}
            // Lost the race with a control command; try again next tick.
            Err(ConnectionError::Busy) => {
                debug!("{}: sync ping yielded to a command", conn.device_id())
            }
            Err(ConnectionError::NotConnected) => break,
            Err(e) => {
                warn!("{}: sync ping failed: {e}", conn.device_id());
                break;
            }
        }
    }

    info!("{}: sync loop stopped", conn.device_id());
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use polyrec_common::protocol::decode_command;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_pings_flow_and_ids_increase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _events) = mpsc::unbounded_channel();
        let clock = MonotonicClock::new();
        let conn_fut = DeviceConnection::connect(
            "rig-1",
            addr,
            Duration::from_secs(10),
            250.0,
            clock.clone(),
            tx,
        );
        let (conn, accepted) = tokio::join!(conn_fut, listener.accept());
        let conn = conn.unwrap();
        let (device, _) = accepted.unwrap();
        let (read_half, mut write_half) = device.into_split();

        let cancel = CancellationToken::new();
        tokio::spawn(run_sync_loop(
            Arc::clone(&conn),
            clock,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        // Echo each ping back as a pong so the busy slot clears and the
        // next tick is allowed to send.
        let mut reader = BufReader::new(read_half);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let Command::SyncPing { ping_id, client_send_time } =
                decode_command(&line).unwrap()
            else {
                panic!("expected SyncPing, got {line}");
            };
            seen.push(ping_id);
            let pong = serde_json::json!({
                "type": "SyncPong",
                "pingId": ping_id,
                "clientSendTime": client_send_time,
                "serverReceiveTime": client_send_time,
                "serverSendTime": client_send_time,
            });
            write_half
                .write_all(format!("{pong}\n").as_bytes())
                .await
                .unwrap();
        }
        cancel.cancel();

        assert_eq!(seen, vec![1, 2, 3]);
    }
}
