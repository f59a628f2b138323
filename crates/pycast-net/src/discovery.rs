//! Session discovery — the external collaborator boundary.
//!
//! pycast's core transfer protocol does not depend on any particular
//! discovery mechanism: a sender announces a session, a receiver
//! browses for one, and how that announcement actually reaches the
//! receiver is a pluggable concern. [`SessionDiscovery`] is that
//! boundary. The one implementation shipped here, [`UdpDiscovery`],
//! periodically broadcasts the session descriptor over a small UDP
//! datagram and folds received announcements into a stream of
//! [`DiscoveryEvent`]s — a stand-in for a real LAN service-discovery
//! stack (mDNS/Zeroconf), not a replacement for one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use pycast_core::session::Session;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// How often an announced session re-broadcasts itself.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
/// How long an announcement is considered live without a refresh.
const SESSION_TTL: Duration = Duration::from_secs(6);

/// A change observed in the set of discoverable sessions.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added(Session),
    Updated(Session),
    Removed(Uuid),
}

/// The discovery boundary a sender/receiver depends on. Implementors
/// own how a session's existence and status reach other hosts on the
/// network; callers only see the session descriptor and an event
/// stream, never socket or protocol details.
#[async_trait::async_trait]
pub trait SessionDiscovery: Send + Sync {
    /// Start advertising a session. Returns a handle that stops
    /// advertising when dropped.
    async fn announce(&self, session: Session) -> Result<AnnounceHandle>;

    /// Update the advertised status of a session already being
    /// announced via the handle returned from `announce`.
    async fn update_status(&self, handle: &AnnounceHandle, status: pycast_core::session::Status);

    /// Subscribe to the stream of sessions discovered on the network.
    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>>;
}

/// Handle to a session this process is announcing. Dropping it (or
/// calling `stop`) ends the announce loop.
pub struct AnnounceHandle {
    session: Arc<tokio::sync::Mutex<Session>>,
    _stop_tx: broadcast::Sender<()>,
}

impl AnnounceHandle {
    pub fn stop(self) {
        // Drop of `_stop_tx` closes the broadcast channel, which the
        // announce loop observes via `recv()` returning `Closed`.
    }
}

/// UDP-broadcast discovery: the minimal concrete implementation of the
/// `SessionDiscovery` boundary. Announcements are plain JSON session
/// descriptors sent on `discovery_port`; listeners fold them into a
/// `DashMap` keyed by session id and emit add/update/remove events,
/// pruning entries that outlive `SESSION_TTL` without a refresh.
pub struct UdpDiscovery {
    discovery_port: u16,
    known: Arc<DashMap<Uuid, (Session, std::time::Instant)>>,
}

impl UdpDiscovery {
    pub fn new(discovery_port: u16) -> Self {
        Self {
            discovery_port,
            known: Arc::new(DashMap::new()),
        }
    }

    async fn broadcast_socket(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind discovery broadcast socket")?;
        socket.set_broadcast(true).context("SO_BROADCAST")?;
        Ok(socket)
    }
}

#[async_trait::async_trait]
impl SessionDiscovery for UdpDiscovery {
    async fn announce(&self, session: Session) -> Result<AnnounceHandle> {
        let session = Arc::new(tokio::sync::Mutex::new(session));
        let (stop_tx, mut stop_rx) = broadcast::channel::<()>(1);
        let socket = self.broadcast_socket().await?;
        let dest: SocketAddr = ([255, 255, 255, 255], self.discovery_port).into();
        let port = self.discovery_port;

        let session_for_task = session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::debug!(port, "discovery announce loop stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        let snapshot = session_for_task.lock().await.clone();
                        match serde_json::to_vec(&snapshot) {
                            Ok(bytes) => {
                                if let Err(e) = socket.send_to(&bytes, dest).await {
                                    tracing::warn!(error = %e, "discovery announce send failed");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to serialize session announcement"),
                        }
                    }
                }
            }
        });

        Ok(AnnounceHandle {
            session,
            _stop_tx: stop_tx,
        })
    }

    async fn update_status(&self, handle: &AnnounceHandle, status: pycast_core::session::Status) {
        handle.session.lock().await.status = status;
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let socket = UdpSocket::bind(("0.0.0.0", self.discovery_port))
            .await
            .context("failed to bind discovery listen socket")?;
        let (tx, rx) = mpsc::channel(32);
        let known = self.known.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut prune = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let (len, _peer) = match result {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(error = %e, "discovery recv_from failed");
                                continue;
                            }
                        };
                        let Ok(session) = serde_json::from_slice::<Session>(&buf[..len]) else {
                            tracing::trace!("discarding malformed discovery announcement");
                            continue;
                        };
                        let now = std::time::Instant::now();
                        let event = if let Some(mut entry) = known.get_mut(&session.id) {
                            entry.1 = now;
                            let changed = entry.0 != session;
                            entry.0 = session.clone();
                            changed.then_some(DiscoveryEvent::Updated(session))
                        } else {
                            known.insert(session.id, (session.clone(), now));
                            Some(DiscoveryEvent::Added(session))
                        };
                        if let Some(event) = event {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = prune.tick() => {
                        let mut expired = Vec::new();
                        known.retain(|id, (_, seen)| {
                            let alive = seen.elapsed() < SESSION_TTL;
                            if !alive {
                                expired.push(*id);
                            }
                            alive
                        });
                        for id in expired {
                            if tx.send(DiscoveryEvent::Removed(id)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
