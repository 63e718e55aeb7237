//! Signaling relay: the rendezvous point peers use to find each other.
//!
//! ```text
//! peer A ──┐  Join{room, token}           ┌── peer B
//!          ├── RoomKey(room, token) ──────┤
//! peer C ──┘        BroadcastGroup        └── Announce → all but sender
//!                                             Signal   → addressed member
//!                                             PeerLeft → on disconnect
//! ```
//!
//! Offers are sealed with a key the relay never sees; it only routes bytes.
//! No document state lives here.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::ReplicaId;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::{BroadcastGroup, JoinRefused, RoomKey, RoomManager, Routed};
use crate::protocol::{ProtocolError, RejectReason, RelayFrame};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            max_members_per_room: 64,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub rejected_joins: u64,
}

struct Member {
    replica: ReplicaId,
    key: RoomKey,
    group: Arc<BroadcastGroup>,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_members_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signaling relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::warn!("Relay connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Member> = None;
        let mut rx: Option<broadcast::Receiver<Arc<Routed>>> = None;

        let result: Result<(), RelayError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.write().await.total_frames += 1;
                                let frame = match RelayFrame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode relay frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let Some(m) = member.as_ref() else {
                                    let RelayFrame::Join { room, token, replica } = frame else {
                                        let encoded = RelayFrame::Rejected {
                                            reason: RejectReason::ExpectedJoin,
                                        }
                                        .encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                        break;
                                    };

                                    let key = RoomKey { room, token };
                                    match rooms.join(&key, replica).await {
                                        Ok((group, receiver)) => {
                                            log::info!("Peer {replica} joined room {}", key.room);
                                            rx = Some(receiver);
                                            member = Some(Member { replica, key, group });
                                        }
                                        Err(refused) => {
                                            let reason = match refused {
                                                JoinRefused::Duplicate => RejectReason::DuplicateReplica,
                                                JoinRefused::Full => RejectReason::RoomFull,
                                            };
                                            log::warn!("Rejected join of {replica} to room {}: {reason:?}", key.room);
                                            stats.write().await.rejected_joins += 1;
                                            let encoded = RelayFrame::Rejected { reason }.encode()?;
                                            ws_sender.send(Message::Binary(encoded.into())).await?;
                                            break;
                                        }
                                    }
                                    continue;
                                };

                                match frame {
                                    RelayFrame::Announce { from, .. } if from == m.replica => {
                                        m.group.broadcast(Routed { from, to: None, bytes: data.to_vec() });
                                    }
                                    RelayFrame::Signal { from, to, .. } if from == m.replica => {
                                        m.group.broadcast(Routed { from, to: Some(to), bytes: data.to_vec() });
                                    }
                                    RelayFrame::Announce { from, .. } | RelayFrame::Signal { from, .. } => {
                                        log::warn!("Peer {} sent a frame claiming to be {from}", m.replica);
                                    }
                                    RelayFrame::Leave => break,
                                    RelayFrame::Ping => {
                                        let encoded = RelayFrame::Pong.encode()?;
                                        ws_sender.send(Message::Binary(encoded.into())).await?;
                                    }
                                    other => {
                                        log::debug!("Ignoring {other:?} from {addr}");
                                    }
                                }
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => break,

                            Some(Err(e)) => {
                                log::debug!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    routed = async {
                        match rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match routed {
                            Ok(routed) => {
                                let Some(m) = member.as_ref() else { continue };
                                if routed.is_for(&m.replica) {
                                    ws_sender.send(Message::Binary(routed.bytes.clone().into())).await?;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Relay member at {addr} lagged by {n} frames");
                                if let Some(m) = member.as_ref() {
                                    m.group.record_dropped(n);
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup runs even when the loop ended with an error.
        if let Some(m) = member {
            let emptied = rooms.leave(&m.key, &m.replica).await;
            match (RelayFrame::PeerLeft { replica: m.replica }).encode() {
                Ok(bytes) => {
                    m.group.broadcast(Routed {
                        from: m.replica,
                        to: None,
                        bytes,
                    });
                }
                Err(e) => log::error!("Failed to encode PeerLeft: {e}"),
            }
            if emptied {
                log::info!("Room {} removed (empty)", m.key.room);
            }
            log::info!("Peer {} left room {}", m.replica, m.key.room);
        }
        stats.write().await.active_connections -= 1;

        let _ = ws_sender.close().await;
        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
