//! Orchestration — lifecycle wiring between discovery, the handshake,
//! and whichever engine (send or receive) the session needs.
//!
//! This module owns no protocol behavior of its own; it sequences
//! calls into `pycast_net` and turns each state transition into a
//! [`StatusEvent`] on a bounded channel, per the design note on
//! re-expressing UI callbacks as messages rather than direct calls.
//! Both `send` and `receive` CLI subcommands are thin wrappers around
//! `run_sender`/`run_receiver`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use pycast_core::session::{Session, Status, TransferParams};
use pycast_net::discovery::{SessionDiscovery, UdpDiscovery};
use pycast_net::handshake::{self, LobbyListener};
use pycast_net::{ReceiveEngine, ReceiveEvent, SendEngine};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Status transitions an orchestrated session can be observed at. A
/// UI (or, here, the CLI's own printer task) subscribes to these
/// rather than being called back into directly.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Waiting,
    Connected,
    Transmitting,
    Completed,
    Cancelled,
    FailedVerification,
    Failed(String),
}

/// Everything a sender-side session needs that isn't the file itself.
pub struct SenderConfig {
    pub session_name: String,
    pub username: String,
    pub handshake_bind: SocketAddr,
    pub multicast_group: std::net::Ipv4Addr,
    pub multicast_port: u16,
    pub nack_port: u16,
    pub discovery_port: u16,
    pub lobby: bool,
    pub params: TransferParams,
}

/// Run a full send session: announce, gate on the handshake, transmit,
/// stop announcing. `cancel` is polled by the send engine between
/// packets; an external caller (e.g. a Ctrl-C handler) can flip it to
/// request cooperative cancellation.
pub async fn run_sender(
    file: PathBuf,
    config: SenderConfig,
    cancel: Arc<std::sync::atomic::AtomicBool>,
    status: mpsc::Sender<StatusEvent>,
) -> Result<()> {
    let _ = status.send(StatusEvent::Waiting).await;

    let session = Session::new(config.session_name, config.username, config.handshake_bind);
    let discovery = UdpDiscovery::new(config.discovery_port);
    let announce_handle = discovery
        .announce(session.clone())
        .await
        .context("failed to start session announcer")?;

    let listener = TcpListener::bind(config.handshake_bind)
        .await
        .context("failed to bind handshake listener")?;

    if config.lobby {
        admit_lobby(listener, session.id).await?;
    } else {
        handshake::respond_single(listener, session.id)
            .await
            .context("single-client handshake failed")?;
    }

    discovery.update_status(&announce_handle, Status::Busy).await;
    let _ = status.send(StatusEvent::Connected).await;

    let engine = SendEngine::bind(
        session.clone(),
        config.multicast_group,
        config.multicast_port,
        config.nack_port,
    )
    .await
    .context("failed to bind multicast send socket")?;

    // Wire the caller's cancel flag into the engine's own: whichever
    // goes false first wins, since both are read with the same
    // cooperative polling loop inside `send_file`.
    let engine_active = engine.cancel_handle();
    let watcher_active = engine_active.clone();
    let watcher = tokio::spawn(async move {
        loop {
            if !cancel.load(Ordering::SeqCst) {
                watcher_active.store(false, Ordering::SeqCst);
                return;
            }
            if !watcher_active.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    });

    let _ = status.send(StatusEvent::Transmitting).await;
    let result = engine.send_file(&file, config.params).await;
    watcher.abort();

    announce_handle.stop();

    match result {
        Ok(()) => {
            let _ = status.send(StatusEvent::Completed).await;
            Ok(())
        }
        Err(_) if !engine_active.load(Ordering::SeqCst) => {
            let _ = status.send(StatusEvent::Cancelled).await;
            tracing::info!("transfer cancelled");
            Ok(())
        }
        Err(e) => {
            let _ = status.send(StatusEvent::Failed(e.to_string())).await;
            Err(e)
        }
    }
}

/// Accept lobby connections until an operator types a line on stdin,
/// then broadcast START and proceed. A real UI would drive
/// `start_transmission` from a button instead of a stdin prompt; the
/// sequencing is the same either way.
async fn admit_lobby(listener: TcpListener, session_id: Uuid) -> Result<()> {
    let (lobby, mut events) = LobbyListener::new(listener, session_id);
    let lobby = Arc::new(lobby);
    let (cancel_tx, cancel_rx) = broadcast::channel(1);

    let accept_lobby = lobby.clone();
    let accept_task = tokio::spawn(async move { accept_lobby.run(cancel_rx).await });

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                pycast_net::handshake::LobbyEvent::ClientJoined(_, username, addr) => {
                    println!("{username} joined from {addr}");
                }
                pycast_net::handshake::LobbyEvent::ClientDisconnected(_, username, addr) => {
                    println!("{username} ({addr}) disconnected before start");
                }
            }
        }
    });

    println!("lobby open — press Enter to start transmission");
    wait_for_stdin_line().await;

    tracing::info!(clients = lobby.clients().len(), "starting transmission");
    lobby.start_transmission().await;
    let _ = cancel_tx.send(());
    let _ = accept_task.await;
    event_task.abort();
    Ok(())
}

async fn wait_for_stdin_line() {
    let _ = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)
    })
    .await;
}

/// Everything a receiver-side session needs. Unlike the sender, a
/// receiver must already know the session id and handshake address —
/// both come from discovery, which this module does not perform on
/// the receiver's behalf (see the `discover` CLI subcommand).
pub struct ReceiverConfig {
    pub session_id: Uuid,
    pub handshake_addr: SocketAddr,
    pub username: String,
    pub output_dir: PathBuf,
    pub multicast_group: std::net::Ipv4Addr,
    pub multicast_port: u16,
    pub nack_port: u16,
}

/// Run a full receive session: join the handshake, then drive the
/// receive engine to completion, forwarding its events as
/// `StatusEvent`s.
pub async fn run_receiver(config: ReceiverConfig, status: mpsc::Sender<StatusEvent>) -> Result<()> {
    let _ = status.send(StatusEvent::Waiting).await;

    if let Err(e) = handshake::join(config.handshake_addr, config.session_id, config.username)
        .await
        .context("handshake failed")
    {
        let _ = status.send(StatusEvent::Failed(e.to_string())).await;
        return Err(e);
    }
    let _ = status.send(StatusEvent::Connected).await;

    let engine = match ReceiveEngine::join(
        config.session_id,
        config.output_dir,
        config.multicast_group,
        config.multicast_port,
        config.handshake_addr,
        config.nack_port,
    )
    .await
    .context("failed to join multicast group")
    {
        Ok(engine) => engine,
        Err(e) => {
            let _ = status.send(StatusEvent::Failed(e.to_string())).await;
            return Err(e);
        }
    };

    let (events_tx, mut events_rx) = mpsc::channel(32);
    let forward_status = status.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let mapped = match event {
                ReceiveEvent::WaitingForMetadata => StatusEvent::Waiting,
                ReceiveEvent::Receiving { .. } => StatusEvent::Transmitting,
                ReceiveEvent::Completed(_) => StatusEvent::Completed,
                ReceiveEvent::ChecksumFailed { .. } => StatusEvent::FailedVerification,
                ReceiveEvent::Cancelled => StatusEvent::Cancelled,
            };
            if forward_status.send(mapped).await.is_err() {
                return;
            }
        }
    });

    let result = engine.run(events_tx).await;
    let _ = forward_task.await;

    if let Err(e) = &result {
        let _ = status.send(StatusEvent::Failed(e.to_string())).await;
    }
    result
}
