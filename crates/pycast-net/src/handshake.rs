//! TCP handshake and lobby — the unicast gate that precedes multicast
//! transmission.
//!
//! A receiver connects to the sender's handshake port and sends a
//! [`JoinRequest`]. In single-client mode the sender accepts exactly
//! one connection, replies `ACK_SINGLE`, and closes the listener. In
//! lobby mode the sender keeps accepting connections, replies
//! `ACK_MULTI` to each, and holds every connection open until the
//! operator starts the transfer, at which point every connected
//! client receives the literal token `START` and the sender begins
//! multicasting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use pycast_core::error::HandshakeError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

/// How long a receiver waits for the sender to complete the TCP
/// handshake before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the sender waits after broadcasting `START` (and closing
/// every lobby connection) before proceeding to transmission — gives
/// clients time to finish reading the token and join the multicast
/// group before the first data packet goes out. A heuristic, not a
/// correctness guarantee (see design notes).
const LOBBY_SETTLE_DELAY: Duration = Duration::from_millis(500);

const ACK_SINGLE: &[u8] = b"ACK_SINGLE";
const ACK_MULTI: &[u8] = b"ACK_MULTI";
const START_TOKEN: &[u8] = b"START";

/// Sent by a receiver immediately after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub session_id: Uuid,
    pub username: String,
}

/// Identifies one connected client within a lobby.
pub type ClientId = u64;

/// A receiver that has joined a lobby and is waiting for `START`.
pub struct ConnectedClient {
    pub id: ClientId,
    pub username: String,
    pub addr: SocketAddr,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
}

/// A change in the lobby's client registry, pushed on a channel rather
/// than delivered through a reentrant callback (design note §9.1).
#[derive(Debug, Clone)]
pub enum LobbyEvent {
    ClientJoined(ClientId, String, SocketAddr),
    /// A client closed its connection (or the socket errored) before
    /// `start_transmission` was called. It has already been removed
    /// from the registry by the time this event is sent.
    ClientDisconnected(ClientId, String, SocketAddr),
}

/// Accept exactly one connection, validate its join request, reply
/// `ACK_SINGLE`, and return the request. The listener is consumed —
/// callers that want to keep listening should use [`LobbyListener`]
/// instead.
pub async fn respond_single(listener: TcpListener, session_id: Uuid) -> Result<JoinRequest> {
    let (mut stream, addr) = listener.accept().await.context("accept failed")?;
    let request = read_join_request(&mut stream).await?;
    if request.session_id != session_id {
        anyhow::bail!(HandshakeError::SessionBusy(request.session_id));
    }
    stream
        .write_all(ACK_SINGLE)
        .await
        .context("failed to send ACK_SINGLE")?;
    tracing::info!(%addr, username = %request.username, "single-client handshake accepted");
    Ok(request)
}

/// Accept loop for multi-client lobby sessions. Owns the registry of
/// connected clients and the one-shot signal that releases them all
/// at once when the operator starts the transfer.
pub struct LobbyListener {
    listener: TcpListener,
    session_id: Uuid,
    clients: Arc<DashMap<ClientId, ConnectedClient>>,
    next_id: AtomicU64,
    start_tx: broadcast::Sender<()>,
    events_tx: mpsc::Sender<LobbyEvent>,
}

impl LobbyListener {
    /// Builds a lobby listener and its paired event stream — every
    /// client join and every pre-`START` disconnect is pushed there for
    /// an observer (UI, orchestration) to react to.
    pub fn new(listener: TcpListener, session_id: Uuid) -> (Self, mpsc::Receiver<LobbyEvent>) {
        let (start_tx, _) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::channel(32);
        (
            Self {
                listener,
                session_id,
                clients: Arc::new(DashMap::new()),
                next_id: AtomicU64::new(0),
                start_tx,
                events_tx,
            },
            events_rx,
        )
    }

    /// Snapshot of usernames/addresses currently in the lobby.
    pub fn clients(&self) -> HashMap<ClientId, (String, SocketAddr)> {
        self.clients
            .iter()
            .map(|e| (*e.key(), (e.value().username.clone(), e.value().addr)))
            .collect()
    }

    /// Accept connections until cancelled. Each accepted client is
    /// validated, registered, and sent `ACK_MULTI`; it then waits
    /// (in its own task) for the start signal.
    pub async fn run(&self, mut cancel: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = cancel.recv() => {
                    tracing::info!("lobby listener shutting down");
                    return;
                }
                result = self.listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    self.handle_connection(stream, addr).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let request = match read_join_request(&mut stream).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "malformed join request, dropping connection");
                return;
            }
        };
        if request.session_id != self.session_id {
            tracing::debug!(%addr, "join request for a different session, dropping");
            return;
        }
        if let Err(e) = stream.write_all(ACK_MULTI).await {
            tracing::warn!(%addr, error = %e, "failed to send ACK_MULTI");
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let username = request.username.clone();
        let (mut read_half, write_half) = stream.into_split();
        let client = ConnectedClient {
            id,
            username: username.clone(),
            addr,
            write_half: Arc::new(Mutex::new(write_half)),
        };
        self.clients.insert(id, client);
        tracing::info!(%addr, username = %username, "client joined lobby");
        let _ = self
            .events_tx
            .send(LobbyEvent::ClientJoined(id, username.clone(), addr))
            .await;

        // Watch for the client hanging up before START is issued. Any
        // bytes read here are unexpected (clients send nothing after
        // their join request) and are simply discarded; only EOF or a
        // socket error means the client disconnected.
        let clients = self.clients.clone();
        let events_tx = self.events_tx.clone();
        let mut start_rx = self.start_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    biased;
                    _ = start_rx.recv() => return,
                    result = read_half.read(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => {
                                if clients.remove(&id).is_some() {
                                    tracing::info!(%addr, username = %username, "client disconnected before start");
                                    let _ = events_tx
                                        .send(LobbyEvent::ClientDisconnected(id, username, addr))
                                        .await;
                                }
                                return;
                            }
                            Ok(_) => continue,
                        }
                    }
                }
            }
        });
    }

    /// Signal every connected client to begin receiving: write `START`
    /// to each open lobby connection, close it, then pause
    /// `LOBBY_SETTLE_DELAY` before returning so clients have time to
    /// read the token and join the multicast group before the first
    /// data packet is on the wire.
    pub async fn start_transmission(&self) {
        let _ = self.start_tx.send(());
        let mut sends = Vec::new();
        for entry in self.clients.iter() {
            let write_half = entry.value().write_half.clone();
            let addr = entry.value().addr;
            sends.push(tokio::spawn(async move {
                let mut guard = write_half.lock().await;
                if let Err(e) = guard.write_all(START_TOKEN).await {
                    tracing::warn!(%addr, error = %e, "failed to send START token");
                }
                if let Err(e) = guard.shutdown().await {
                    tracing::warn!(%addr, error = %e, "failed to close lobby connection after START");
                }
            }));
        }
        for send in sends {
            let _ = send.await;
        }
        tokio::time::sleep(LOBBY_SETTLE_DELAY).await;
    }
}

async fn read_join_request(stream: &mut TcpStream) -> Result<JoinRequest> {
    let mut buf = vec![0u8; 1024];
    let n = timeout(CONNECT_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .context("read failed")?;
    if n == 0 {
        anyhow::bail!(HandshakeError::ConnectionClosed);
    }
    let request: JoinRequest =
        serde_json::from_slice(&buf[..n]).map_err(HandshakeError::MalformedRequest)?;
    Ok(request)
}

/// Connect to a single-client session, send the join request, and
/// wait for `ACK_SINGLE`.
pub async fn join_single(addr: SocketAddr, session_id: Uuid, username: String) -> Result<()> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    send_join_request(&mut stream, session_id, username).await?;
    expect_token(&mut stream, ACK_SINGLE).await
}

/// Connect to a lobby session, send the join request, wait for
/// `ACK_MULTI`, then block until `START` arrives.
pub async fn join_lobby(addr: SocketAddr, session_id: Uuid, username: String) -> Result<()> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    send_join_request(&mut stream, session_id, username).await?;
    expect_token(&mut stream, ACK_MULTI).await?;
    expect_token(&mut stream, START_TOKEN).await
}

/// Connect and join without knowing in advance whether the session is
/// single-client or lobby: read whichever ACK the sender actually
/// sends back and branch accordingly. This is what a receiver uses in
/// practice, since discovery advertises a session but not its
/// admission mode.
pub async fn join(addr: SocketAddr, session_id: Uuid, username: String) -> Result<()> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    send_join_request(&mut stream, session_id, username).await?;

    let mut buf = vec![0u8; ACK_SINGLE.len().max(ACK_MULTI.len())];
    let n = stream
        .read(&mut buf)
        .await
        .context("failed to read handshake ack")?;
    if n == 0 {
        anyhow::bail!(HandshakeError::ConnectionClosed);
    }
    match &buf[..n] {
        ACK_SINGLE => Ok(()),
        ACK_MULTI => expect_token(&mut stream, START_TOKEN).await,
        other => anyhow::bail!("unexpected handshake token: {:?}", other),
    }
}

async fn send_join_request(stream: &mut TcpStream, session_id: Uuid, username: String) -> Result<()> {
    let request = JoinRequest { session_id, username };
    let bytes = serde_json::to_vec(&request)?;
    stream.write_all(&bytes).await.context("failed to send join request")
}

async fn expect_token(stream: &mut TcpStream, expected: &[u8]) -> Result<()> {
    let mut buf = vec![0u8; expected.len()];
    stream
        .read_exact(&mut buf)
        .await
        .context("failed to read expected token")?;
    if buf != expected {
        anyhow::bail!("unexpected handshake token: {:?}", buf);
    }
    Ok(())
}
