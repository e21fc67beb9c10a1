//! Polyrec Capture Daemon – runs on the multi-sensor capture device.
//!
//! This binary:
//! 1. Reads configuration from `polyrec.conf`
//! 2. Answers controller discovery probes over UDP broadcast
//! 3. Serves the TCP command channel that drives recording sessions
//! 4. Streams best-effort telemetry to the connected controller

mod collaborator;
mod discovery;
mod server;
mod session;
mod streaming;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use polyrec_common::sync::MonotonicClock;

use collaborator::{Collaborator, Modality, SimulatedCollaborator};
use session::SessionController;
use streaming::StreamingPublisher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| polyrec_common::config::Config::default_path().to_string());
    let config =
        polyrec_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Polyrec Capture Daemon starting (device={}, command_port={})",
        config.device_id, config.command_port
    );

    // One supervisory scope: cancelling this token stops every task and
    // closes every socket exactly once.
    let cancel = CancellationToken::new();

    // ── ctrl-c ───────────────────────────────────────────────────────
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            cancel.cancel();
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── shared clock + streaming publisher ───────────────────────────
    let clock = MonotonicClock::new();
    let publisher = Arc::new(StreamingPublisher::new(config.streaming_port).await?);

    // ── capture collaborators per configured capability ──────────────
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut collaborators: Vec<Box<dyn Collaborator>> = Vec::new();
    for name in &config.device_capabilities {
        let Some(modality) = Modality::from_name(name) else {
            warn!("Unknown capability '{name}' in config, skipped");
            continue;
        };
        let mut c = SimulatedCollaborator::new(
            modality,
            &config.device_id,
            Arc::clone(&publisher),
            clock.clone(),
        );
        c.set_event_sender(event_tx.clone());
        collaborators.push(Box::new(c));
    }
    info!("{} capture collaborator(s) attached", collaborators.len());

    let controller = Arc::new(Mutex::new(SessionController::new(
        &config.device_id,
        collaborators,
        clock.clone(),
    )));

    // ── collaborator event drain ─────────────────────────────────────
    // Collaborators notify over a channel; the session controller applies
    // the events on this task, never from driver threads.
    {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };
                controller.lock().await.apply_event(event);
            }
        });
    }

    // ── discovery responder ──────────────────────────────────────────
    let discovery_task = {
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run(config, cancel).await {
                tracing::error!("Discovery responder error: {e:#}");
            }
        })
    };

    // ── command server ───────────────────────────────────────────────
    let server_task = {
        let listen_addr = format!("0.0.0.0:{}", config.command_port);
        let controller = Arc::clone(&controller);
        let publisher = Arc::clone(&publisher);
        let clock = clock.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                server::run(&listen_addr, controller, publisher, clock, cancel).await
            {
                tracing::error!("Command server error: {e:#}");
            }
        })
    };

    // ── main loop: periodic stats until shutdown ─────────────────────
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                let ctrl = controller.lock().await;
                info!(
                    "State={:?} session={:?} streaming_peer={:?}",
                    ctrl.state(),
                    ctrl.session().map(|s| s.session_id.clone()),
                    publisher.peer(),
                );
            }
        }
    }

    // Drain the subsystem: every task sees the cancelled token, finishes
    // its in-flight work and releases its socket.
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        let _ = server_task.await;
        let _ = discovery_task.await;
    })
    .await;

    info!("Polyrec Capture Daemon stopped");
    Ok(())
}
