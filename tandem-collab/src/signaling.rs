//! Signaling client: finds the other peers of a room through the relay.
//!
//! ```text
//! join() ──► Join{room, token} ──► Announce{sealed offer}
//!                 ▲                      │
//!                 │ backoff              ▼
//!          relay lost ◄──── Announce from X ──► Signal{to: X, sealed offer}
//!                                 │
//!                                 ▼
//!                     SignalingEvent::PeerDiscovered
//! ```
//!
//! Offers are sealed with the room's signaling key, so the relay (and anyone
//! in the same room name without the secret) learns nothing from them.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::ReplicaId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::backoff::BackoffPolicy;
use crate::crypto::{CryptoError, RoomKeys, SealingKey};
use crate::protocol::{ConnectionOffer, ProtocolError, RejectReason, RelayFrame};

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("signaling task already stopped")]
    Stopped,
    #[error("no relay configured")]
    NoRelay,
}

/// Relay connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the signaling client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Joined the relay and announced ourselves.
    Connected,
    /// Relay connection lost; a reconnect is scheduled.
    Disconnected,
    /// Another room member told us where to reach it.
    PeerDiscovered {
        peer: ReplicaId,
        offer: ConnectionOffer,
    },
    /// The relay saw `peer` disconnect.
    PeerLeft(ReplicaId),
    /// Someone else uses our replica id. The client stops.
    DuplicateReplica,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// `ws://host:port` of each relay, tried in turn
    pub relay_urls: Vec<String>,
    /// Reconnect policy for the relay connection
    pub backoff: BackoffPolicy,
    /// Relay keepalive interval
    pub ping_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_urls: vec!["ws://127.0.0.1:4444".to_string()],
            backoff: BackoffPolicy::default(),
            ping_interval: Duration::from_secs(20),
        }
    }
}

enum Command {
    Reannounce,
    Leave(oneshot::Sender<()>),
}

/// How one relay connection ended.
enum Outcome {
    Left,
    Lost,
    Fatal,
    Rejected(RejectReason),
}

/// Handle to the background signaling task.
pub struct SignalingClient {
    replica: ReplicaId,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    command_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Start joining `room` and keep the membership alive until [`leave`].
    ///
    /// [`leave`]: SignalingClient::leave
    pub fn join(
        config: SignalingConfig,
        room: impl Into<String>,
        keys: &RoomKeys,
        offer: ConnectionOffer,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        if config.relay_urls.is_empty() {
            return Err(SignalingError::NoRelay);
        }
        let room = room.into();
        let encoded_offer = offer.encode()?;
        // Fail early if sealing is broken rather than inside the retry loop.
        keys.signaling().seal(&encoded_offer)?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(8);
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let worker = Worker {
            config,
            relay: 0,
            room: room.clone(),
            token: keys.token_hex(),
            key: keys.signaling().clone(),
            offer,
            encoded_offer,
            state: state.clone(),
            event_tx,
            command_rx,
        };
        let task = tokio::spawn(worker.run());

        Ok((
            Self {
                replica: offer.replica,
                room,
                state,
                command_tx,
                task,
            },
            event_rx,
        ))
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Announce our offer to the room again, so peers we lost reply and
    /// can be dialed afresh. A no-op while the relay is unreachable; the
    /// reconnect announces anyway.
    pub fn reannounce(&self) -> Result<(), SignalingError> {
        match self.command_tx.try_send(Command::Reannounce) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalingError::Stopped),
        }
    }

    /// Send `Leave`, close the relay socket and stop retrying.
    pub async fn leave(self) -> Result<(), SignalingError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = self.command_tx.send(Command::Leave(ack_tx)).await.is_ok();
        if sent {
            // A connect attempt in flight does not poll commands; don't wait on it.
            let _ = tokio::time::timeout(Duration::from_secs(1), ack_rx).await;
        }
        self.task.abort();
        *self.state.write().await = ConnectionState::Disconnected;
        if sent {
            Ok(())
        } else {
            Err(SignalingError::Stopped)
        }
    }
}

struct Worker {
    config: SignalingConfig,
    /// Index into `config.relay_urls`
    relay: usize,
    room: String,
    token: String,
    key: SealingKey,
    offer: ConnectionOffer,
    encoded_offer: Vec<u8>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SignalingEvent>,
    command_rx: mpsc::Receiver<Command>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt = 0u32;
        let mut first_connection = true;

        loop {
            let url = self.config.relay_urls[self.relay].clone();
            match tokio_tungstenite::connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    let outcome = self.serve(ws_stream).await;
                    *self.state.write().await = ConnectionState::Disconnected;

                    match outcome {
                        Ok(Outcome::Left) => return,
                        Ok(Outcome::Fatal) => {
                            let _ = self.event_tx.send(SignalingEvent::DuplicateReplica).await;
                            return;
                        }
                        Ok(Outcome::Rejected(RejectReason::DuplicateReplica)) if first_connection => {
                            log::error!("Relay reports replica {} already in room {}", self.offer.replica, self.room);
                            let _ = self.event_tx.send(SignalingEvent::DuplicateReplica).await;
                            return;
                        }
                        Ok(Outcome::Rejected(reason)) => {
                            log::warn!("Relay rejected join to room {}: {reason:?}", self.room);
                            first_connection = false;
                        }
                        Ok(Outcome::Lost) => {
                            log::info!("Lost relay {url} for room {}", self.room);
                            first_connection = false;
                            self.next_relay();
                        }
                        // A join that never completed still counts as the first one.
                        Err(e) => {
                            log::warn!("Relay connection for room {} failed: {e}", self.room);
                            self.next_relay();
                        }
                    }
                    let _ = self.event_tx.send(SignalingEvent::Disconnected).await;
                }
                Err(e) => {
                    log::debug!("Connecting to relay {url} failed: {e}");
                    self.next_relay();
                }
            }

            let Some(delay) = self.config.backoff.delay(attempt) else {
                log::warn!("Giving up on relays for room {} after {attempt} attempts", self.room);
                *self.state.write().await = ConnectionState::Disconnected;
                return;
            };
            attempt += 1;
            *self.state.write().await = ConnectionState::Reconnecting;
            log::debug!("Reconnecting to relay in {delay:?}");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.command_rx.recv() => match cmd {
                        // The reconnect announces anyway.
                        Some(Command::Reannounce) => {}
                        Some(Command::Leave(ack)) => {
                            let _ = ack.send(());
                            return;
                        }
                        None => return,
                    },
                }
            }
        }
    }

    fn next_relay(&mut self) {
        self.relay = (self.relay + 1) % self.config.relay_urls.len();
    }

    fn sealed_offer(&self) -> Result<Vec<u8>, SignalingError> {
        Ok(self.key.seal(&self.encoded_offer)?)
    }

    /// Drive one relay connection until it ends.
    async fn serve<S>(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
    ) -> Result<Outcome, SignalingError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let local = self.offer.replica;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let join = RelayFrame::Join {
            room: self.room.clone(),
            token: self.token.clone(),
            replica: local,
        };
        ws_sender.send(Message::Binary(join.encode()?.into())).await?;
        let announce = RelayFrame::Announce {
            from: local,
            sealed: self.sealed_offer()?,
        };
        ws_sender.send(Message::Binary(announce.encode()?.into())).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SignalingEvent::Connected).await;
        log::info!("Announced {local} in room {}", self.room);

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(Outcome::Lost),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => continue,
                    };

                    let frame = match RelayFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Failed to decode relay frame: {e}");
                            continue;
                        }
                    };

                    match frame {
                        RelayFrame::Announce { from, .. } if from == local => {
                            log::error!("Another peer announced our replica id {local}");
                            return Ok(Outcome::Fatal);
                        }
                        RelayFrame::Announce { from, sealed } => {
                            if let Some(offer) = self.open_offer(from, &sealed) {
                                let reply = RelayFrame::Signal {
                                    from: local,
                                    to: from,
                                    sealed: self.sealed_offer()?,
                                };
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                let _ = self.event_tx.send(SignalingEvent::PeerDiscovered { peer: from, offer }).await;
                            }
                        }
                        RelayFrame::Signal { from, to, sealed } if to == local => {
                            if let Some(offer) = self.open_offer(from, &sealed) {
                                let _ = self.event_tx.send(SignalingEvent::PeerDiscovered { peer: from, offer }).await;
                            }
                        }
                        RelayFrame::PeerLeft { replica } => {
                            let _ = self.event_tx.send(SignalingEvent::PeerLeft(replica)).await;
                        }
                        RelayFrame::Rejected { reason } => return Ok(Outcome::Rejected(reason)),
                        RelayFrame::Ping => {
                            ws_sender.send(Message::Binary(RelayFrame::Pong.encode()?.into())).await?;
                        }
                        other => log::trace!("Ignoring {other:?} from relay"),
                    }
                }

                cmd = self.command_rx.recv() => {
                    if let Some(Command::Reannounce) = cmd {
                        let announce = RelayFrame::Announce {
                            from: local,
                            sealed: self.sealed_offer()?,
                        };
                        ws_sender.send(Message::Binary(announce.encode()?.into())).await?;
                        log::debug!("Re-announced {local} in room {}", self.room);
                        continue;
                    }
                    let _ = ws_sender
                        .send(Message::Binary(RelayFrame::Leave.encode()?.into()))
                        .await;
                    let _ = ws_sender.close().await;
                    if let Some(Command::Leave(ack)) = cmd {
                        let _ = ack.send(());
                    }
                    log::info!("Left room {}", self.room);
                    return Ok(Outcome::Left);
                }

                _ = ping.tick() => {
                    ws_sender.send(Message::Binary(RelayFrame::Ping.encode()?.into())).await?;
                }
            }
        }
    }

    /// Unseal an offer and check it belongs to its sender.
    fn open_offer(&self, from: ReplicaId, sealed: &[u8]) -> Option<ConnectionOffer> {
        let plain = match self.key.open(sealed) {
            Ok(plain) => plain,
            Err(e) => {
                log::warn!("Discarding offer from {from}: {e}");
                return None;
            }
        };
        match ConnectionOffer::decode(&plain) {
            Ok(offer) if offer.replica == from => Some(offer),
            Ok(offer) => {
                log::warn!("Offer from {from} names replica {}", offer.replica);
                None
            }
            Err(e) => {
                log::warn!("Malformed offer from {from}: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayServer;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn start_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::with_defaults();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        format!("ws://{addr}")
    }

    fn config(url: &str) -> SignalingConfig {
        SignalingConfig {
            relay_urls: vec![url.to_string()],
            backoff: BackoffPolicy::bounded(3).with_initial(Duration::from_millis(20)),
            ..SignalingConfig::default()
        }
    }

    fn offer(n: u128, port: u16) -> ConnectionOffer {
        ConnectionOffer {
            replica: ReplicaId::from_u128(n),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SignalingEvent>) -> SignalingEvent {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("event channel closed")
    }

    async fn discovered(rx: &mut mpsc::Receiver<SignalingEvent>) -> (ReplicaId, ConnectionOffer) {
        loop {
            if let SignalingEvent::PeerDiscovered { peer, offer } = next_event(rx).await {
                return (peer, offer);
            }
        }
    }

    #[tokio::test]
    async fn test_peers_discover_each_other() {
        let url = start_relay().await;
        let keys = RoomKeys::derive("test-room", "password").unwrap();

        let (a, mut a_rx) = SignalingClient::join(config(&url), "test-room", &keys, offer(1, 5001)).unwrap();
        assert_eq!(next_event(&mut a_rx).await, SignalingEvent::Connected);
        assert_eq!(a.connection_state().await, ConnectionState::Connected);

        let (b, mut b_rx) = SignalingClient::join(config(&url), "test-room", &keys, offer(2, 5002)).unwrap();

        // B's announce reaches A; A's reply reaches B.
        let (peer, seen) = discovered(&mut a_rx).await;
        assert_eq!(peer, ReplicaId::from_u128(2));
        assert_eq!(seen, offer(2, 5002));

        let (peer, seen) = discovered(&mut b_rx).await;
        assert_eq!(peer, ReplicaId::from_u128(1));
        assert_eq!(seen.listen_addr.port(), 5001);

        b.leave().await.unwrap();
        loop {
            if next_event(&mut a_rx).await == SignalingEvent::PeerLeft(ReplicaId::from_u128(2)) {
                break;
            }
        }
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_reannounce_is_answered_again() {
        let url = start_relay().await;
        let keys = RoomKeys::derive("test-room", "password").unwrap();

        let (a, mut a_rx) = SignalingClient::join(config(&url), "test-room", &keys, offer(1, 5001)).unwrap();
        assert_eq!(next_event(&mut a_rx).await, SignalingEvent::Connected);
        let (_b, mut b_rx) = SignalingClient::join(config(&url), "test-room", &keys, offer(2, 5002)).unwrap();
        discovered(&mut a_rx).await;
        discovered(&mut b_rx).await;

        a.reannounce().unwrap();

        let (peer, _) = discovered(&mut b_rx).await;
        assert_eq!(peer, ReplicaId::from_u128(1));
        let (peer, seen) = discovered(&mut a_rx).await;
        assert_eq!(peer, ReplicaId::from_u128(2));
        assert_eq!(seen, offer(2, 5002));
    }

    #[tokio::test]
    async fn test_fails_over_to_next_relay() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_url = format!("ws://{}", dead.local_addr().unwrap());
        drop(dead);
        let url = start_relay().await;

        let keys = RoomKeys::derive("r", "s").unwrap();
        let config = SignalingConfig {
            relay_urls: vec![dead_url, url],
            ..config("unused")
        };
        let (client, mut rx) = SignalingClient::join(config, "r", &keys, offer(1, 5001)).unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::Connected);
        client.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_needs_a_relay() {
        let keys = RoomKeys::derive("r", "s").unwrap();
        let config = SignalingConfig {
            relay_urls: Vec::new(),
            ..SignalingConfig::default()
        };
        let result = SignalingClient::join(config, "r", &keys, offer(1, 5001));
        assert!(matches!(result, Err(SignalingError::NoRelay)));
    }

    #[tokio::test]
    async fn test_different_secret_never_meets() {
        let url = start_relay().await;
        let ours = RoomKeys::derive("test-room", "password").unwrap();
        let theirs = RoomKeys::derive("test-room", "other").unwrap();

        let (_a, mut a_rx) = SignalingClient::join(config(&url), "test-room", &ours, offer(1, 5001)).unwrap();
        assert_eq!(next_event(&mut a_rx).await, SignalingEvent::Connected);
        let (_b, mut b_rx) = SignalingClient::join(config(&url), "test-room", &theirs, offer(2, 5002)).unwrap();
        assert_eq!(next_event(&mut b_rx).await, SignalingEvent::Connected);

        assert!(timeout(Duration::from_millis(300), a_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_replica_is_fatal() {
        let url = start_relay().await;
        let keys = RoomKeys::derive("test-room", "password").unwrap();

        let (_a, mut a_rx) = SignalingClient::join(config(&url), "test-room", &keys, offer(1, 5001)).unwrap();
        assert_eq!(next_event(&mut a_rx).await, SignalingEvent::Connected);

        let (_twin, mut twin_rx) = SignalingClient::join(config(&url), "test-room", &keys, offer(1, 5009)).unwrap();
        assert_eq!(next_event(&mut twin_rx).await, SignalingEvent::Connected);
        assert_eq!(next_event(&mut twin_rx).await, SignalingEvent::DuplicateReplica);
        // The worker stopped, so the channel closes.
        assert_eq!(timeout(Duration::from_secs(1), twin_rx.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_relay_gives_up_with_bounded_policy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let keys = RoomKeys::derive("r", "s").unwrap();
        let (client, mut rx) = SignalingClient::join(config(&url), "r", &keys, offer(1, 5001)).unwrap();
        assert_eq!(timeout(Duration::from_secs(3), rx.recv()).await.unwrap(), None);
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.leave().await.is_err());
    }
}
