//! Direct peer-to-peer links.
//!
//! Every session listens on one socket and advertises it through signaling.
//! For each pair of peers only the one with the smaller replica id dials, so a
//! pair never ends up with two links.
//!
//! ```text
//! dialer                          acceptor
//!   │── sealed Hello{dialer} ──────►│   wrong key / wrong id → dropped
//!   │◄──────── sealed Hello{acceptor}│
//!   ▼                               ▼
//!  Open: reader task ─► LinkEvent ─► PeerTransport::next_event()
//!        writer task ◄─ mpsc ◄────── PeerTransport::send()
//! ```
//!
//! `PeerTransport` has a single owner (the session task). Background tasks
//! report through one channel; `next_event` folds those reports into the link
//! table and hands out the public [`TransportEvent`]s.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::ReplicaId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::backoff::BackoffPolicy;
use crate::crypto::{CryptoError, SealingKey};
use crate::protocol::{ConnectionOffer, PeerFrame, ProtocolError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("timed out")]
    Timeout,
    #[error("no open link to {0}")]
    NotConnected(ReplicaId),
    #[error("outbound queue to {0} is full")]
    Backpressure(ReplicaId),
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Listener address; port 0 picks a free port
    pub bind_addr: String,
    /// Address advertised to peers instead of the bound IP
    pub advertise_ip: Option<IpAddr>,
    /// Upper bound on open plus dialing links
    pub max_connections: usize,
    /// Limit for the connect and Hello exchange
    pub handshake_timeout: Duration,
    /// Retry policy for dialing; must be bounded
    pub dial_backoff: BackoffPolicy,
    /// Frames queued per link before sends are dropped
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_ip: None,
            max_connections: 10,
            handshake_timeout: Duration::from_secs(5),
            dial_backoff: BackoffPolicy::bounded(5),
            outbound_buffer: 256,
        }
    }
}

/// State of the link to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

/// Per-link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

/// What the owner of a transport is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake done; frames can flow.
    Opened { peer: ReplicaId },
    /// A frame that opened under the room key.
    Message { peer: ReplicaId, bytes: Vec<u8> },
    /// The link went away. The dialing side retries on its own.
    Closed { peer: ReplicaId },
    /// Dialing gave up after the configured attempts.
    Unreachable { peer: ReplicaId },
}

/// Reports from background tasks.
enum LinkEvent {
    Established {
        peer: ReplicaId,
        link_id: u64,
        outbound: mpsc::Sender<Vec<u8>>,
        tasks: [AbortHandle; 2],
    },
    Frame {
        peer: ReplicaId,
        link_id: u64,
        bytes: Vec<u8>,
    },
    Lost {
        peer: ReplicaId,
        link_id: u64,
    },
    DialFailed {
        peer: ReplicaId,
    },
}

enum Link {
    Dialing {
        task: AbortHandle,
    },
    Open {
        link_id: u64,
        outbound: mpsc::Sender<Vec<u8>>,
        tasks: [AbortHandle; 2],
    },
}

impl Link {
    fn state(&self) -> LinkState {
        match self {
            Link::Dialing { .. } => LinkState::Connecting,
            Link::Open { .. } => LinkState::Open,
        }
    }

    fn abort(&self) {
        match self {
            Link::Dialing { task } => task.abort(),
            Link::Open { tasks, .. } => tasks.iter().for_each(AbortHandle::abort),
        }
    }
}

/// Shared by the listener, dial tasks and links.
#[derive(Clone)]
struct Shared {
    local: ReplicaId,
    key: SealingKey,
    config: TransportConfig,
    events: mpsc::Sender<LinkEvent>,
    next_link_id: Arc<AtomicU64>,
}

/// Encrypted mesh links of one session.
pub struct PeerTransport {
    shared: Shared,
    listen_addr: SocketAddr,
    links: HashMap<ReplicaId, Link>,
    offers: HashMap<ReplicaId, ConnectionOffer>,
    stats: HashMap<ReplicaId, LinkStats>,
    events_rx: mpsc::Receiver<LinkEvent>,
    accept_task: JoinHandle<()>,
}

impl PeerTransport {
    /// Bind the listener and start accepting peers.
    pub async fn bind(
        local: ReplicaId,
        key: SealingKey,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let bound = listener.local_addr()?;
        let listen_addr = SocketAddr::new(config.advertise_ip.unwrap_or(bound.ip()), bound.port());
        log::info!("Replica {local} accepting peers on {bound}");

        let (events, events_rx) = mpsc::channel(1024);
        let shared = Shared {
            local,
            key,
            config,
            events,
            next_link_id: Arc::new(AtomicU64::new(1)),
        };
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Self {
            shared,
            listen_addr,
            links: HashMap::new(),
            offers: HashMap::new(),
            stats: HashMap::new(),
            events_rx,
            accept_task,
        })
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.shared.local
    }

    /// Address peers should dial.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn offer(&self) -> ConnectionOffer {
        ConnectionOffer {
            replica: self.shared.local,
            listen_addr: self.listen_addr,
        }
    }

    /// Start a link to a discovered peer.
    ///
    /// Returns `true` if a dial was started. The larger replica id of a pair
    /// only remembers the offer and waits to be dialed.
    pub fn connect(&mut self, peer: ReplicaId, offer: ConnectionOffer) -> bool {
        if peer == self.shared.local || offer.replica != peer {
            return false;
        }
        self.offers.insert(peer, offer);

        if self.links.contains_key(&peer) {
            return false;
        }
        if self.shared.local > peer {
            log::debug!("Waiting for {peer} to dial us");
            return false;
        }
        if self.links.len() >= self.shared.config.max_connections {
            log::warn!("Ignoring {peer}: {} links already", self.links.len());
            return false;
        }
        self.spawn_dial(peer, offer);
        true
    }

    fn spawn_dial(&mut self, peer: ReplicaId, offer: ConnectionOffer) {
        log::debug!("Dialing {peer} at {}", offer.listen_addr);
        let task = tokio::spawn(dial(self.shared.clone(), peer, offer));
        self.links.insert(
            peer,
            Link::Dialing {
                task: task.abort_handle(),
            },
        );
    }

    /// Queue `bytes` for `peer`. Never waits: a full queue drops the frame.
    pub fn send(&mut self, peer: ReplicaId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let Some(Link::Open { outbound, .. }) = self.links.get(&peer) else {
            return Err(TransportError::NotConnected(peer));
        };
        let stats = self.stats.entry(peer).or_default();
        match outbound.try_send(bytes) {
            Ok(()) => {
                stats.frames_sent += 1;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                stats.frames_dropped += 1;
                Err(TransportError::Backpressure(peer))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotConnected(peer)),
        }
    }

    /// Send to every open link except `except`. Returns how many accepted it.
    pub fn broadcast(&mut self, bytes: &[u8], except: Option<ReplicaId>) -> usize {
        let peers: Vec<ReplicaId> = self.open_peers().filter(|p| Some(*p) != except).collect();
        peers
            .into_iter()
            .filter(|peer| match self.send(*peer, bytes.to_vec()) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Broadcast to {peer} skipped: {e}");
                    false
                }
            })
            .count()
    }

    /// Drop the link to `peer` and forget its offer. No redial.
    pub fn close(&mut self, peer: ReplicaId) {
        self.offers.remove(&peer);
        if let Some(link) = self.links.remove(&peer) {
            log::debug!("Closing link to {peer}");
            link.abort();
        }
    }

    pub fn state(&self, peer: &ReplicaId) -> LinkState {
        self.links.get(peer).map_or(LinkState::Closed, Link::state)
    }

    pub fn stats(&self, peer: &ReplicaId) -> LinkStats {
        self.stats.get(peer).copied().unwrap_or_default()
    }

    pub fn open_peers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.links
            .iter()
            .filter(|(_, link)| matches!(link, Link::Open { .. }))
            .map(|(peer, _)| *peer)
    }

    pub fn open_count(&self) -> usize {
        self.open_peers().count()
    }

    /// Next event for the owner. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let report = self.events_rx.recv().await?;
            if let Some(event) = self.fold(report) {
                return Some(event);
            }
        }
    }

    fn fold(&mut self, report: LinkEvent) -> Option<TransportEvent> {
        match report {
            LinkEvent::Established {
                peer,
                link_id,
                outbound,
                tasks,
            } => {
                let keep_existing = matches!(self.links.get(&peer), Some(Link::Open { .. }));
                let full = !self.links.contains_key(&peer)
                    && self.links.len() >= self.shared.config.max_connections;
                if keep_existing || full {
                    log::debug!("Dropping extra link {link_id} to {peer}");
                    tasks.iter().for_each(AbortHandle::abort);
                    return None;
                }
                if let Some(previous) = self.links.remove(&peer) {
                    previous.abort();
                }
                log::info!("Link {link_id} to {peer} open");
                self.links.insert(
                    peer,
                    Link::Open {
                        link_id,
                        outbound,
                        tasks,
                    },
                );
                Some(TransportEvent::Opened { peer })
            }

            LinkEvent::Frame {
                peer,
                link_id,
                bytes,
            } => {
                if !self.is_current(&peer, link_id) {
                    return None;
                }
                self.stats.entry(peer).or_default().frames_received += 1;
                Some(TransportEvent::Message { peer, bytes })
            }

            LinkEvent::Lost { peer, link_id } => {
                if !self.is_current(&peer, link_id) {
                    return None;
                }
                if let Some(link) = self.links.remove(&peer) {
                    link.abort();
                }
                log::info!("Link {link_id} to {peer} closed");
                if self.shared.local < peer {
                    if let Some(offer) = self.offers.get(&peer).copied() {
                        self.spawn_dial(peer, offer);
                    }
                }
                Some(TransportEvent::Closed { peer })
            }

            LinkEvent::DialFailed { peer } => {
                if !matches!(self.links.get(&peer), Some(Link::Dialing { .. })) {
                    return None;
                }
                self.links.remove(&peer);
                log::warn!("Peer {peer} unreachable");
                Some(TransportEvent::Unreachable { peer })
            }
        }
    }

    fn is_current(&self, peer: &ReplicaId, id: u64) -> bool {
        matches!(self.links.get(peer), Some(Link::Open { link_id, .. }) if *link_id == id)
    }

    /// Close every link and stop listening. Frames already queued are still
    /// written before each socket closes.
    pub fn shutdown(&mut self) {
        self.accept_task.abort();
        for (peer, link) in self.links.drain() {
            match link {
                Link::Dialing { task } => task.abort(),
                // Dropping `outbound` lets the writer drain and close.
                Link::Open { tasks: [reader, _], .. } => {
                    log::debug!("Shutting down link to {peer}");
                    reader.abort();
                }
            }
        }
        self.offers.clear();
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, shared: Shared) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::debug!("Incoming peer connection from {addr}");
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_one(stream, shared).await {
                        log::warn!("Rejected peer connection from {addr}: {e}");
                    }
                });
            }
            Err(e) => {
                log::warn!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_one(stream: TcpStream, shared: Shared) -> Result<(), TransportError> {
    let limit = shared.config.handshake_timeout;
    let mut ws = tokio::time::timeout(limit, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| TransportError::Timeout)??;

    let peer = tokio::time::timeout(limit, recv_hello(&mut ws, &shared.key))
        .await
        .map_err(|_| TransportError::Timeout)??;
    if peer == shared.local {
        return Err(TransportError::Handshake(format!("peer claims our id {peer}")));
    }
    send_hello(&mut ws, &shared.key, shared.local).await?;

    establish(ws, peer, &shared).await;
    Ok(())
}

async fn dial(shared: Shared, peer: ReplicaId, offer: ConnectionOffer) {
    let mut attempt = 0u32;
    loop {
        match dial_once(&shared, peer, offer).await {
            Ok(ws) => {
                establish(ws, peer, &shared).await;
                return;
            }
            Err(e) => log::debug!("Dial {peer} attempt {attempt} failed: {e}"),
        }

        let Some(delay) = shared.config.dial_backoff.delay(attempt) else {
            let _ = shared.events.send(LinkEvent::DialFailed { peer }).await;
            return;
        };
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

async fn dial_once(
    shared: &Shared,
    peer: ReplicaId,
    offer: ConnectionOffer,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>, TransportError> {
    let limit = shared.config.handshake_timeout;
    let url = format!("ws://{}", offer.listen_addr);
    let (mut ws, _) = tokio::time::timeout(limit, tokio_tungstenite::connect_async(&url))
        .await
        .map_err(|_| TransportError::Timeout)??;

    send_hello(&mut ws, &shared.key, shared.local).await?;
    let remote = tokio::time::timeout(limit, recv_hello(&mut ws, &shared.key))
        .await
        .map_err(|_| TransportError::Timeout)??;
    if remote != peer {
        return Err(TransportError::Handshake(format!("expected {peer}, got {remote}")));
    }
    Ok(ws)
}

async fn send_hello<S>(
    ws: &mut WebSocketStream<S>,
    key: &SealingKey,
    local: ReplicaId,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = PeerFrame::Hello { replica: local }.encode()?;
    ws.send(Message::Binary(key.seal(&hello)?.into())).await?;
    Ok(())
}

async fn recv_hello<S>(ws: &mut WebSocketStream<S>, key: &SealingKey) -> Result<ReplicaId, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let plain = key.open(&data)?;
                return match PeerFrame::decode(&plain)? {
                    PeerFrame::Hello { replica } => Ok(replica),
                    other => Err(TransportError::Protocol(ProtocolError::Unexpected(other.kind()))),
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake("closed before hello".into()));
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(_)) => {}
        }
    }
}

/// Split a handshaken socket into reader and writer tasks and report it.
async fn establish<S>(ws: WebSocketStream<S>, peer: ReplicaId, shared: &Shared)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let link_id = shared.next_link_id.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(shared.config.outbound_buffer);

    // Writer task: seal and forward the outgoing channel
    let writer_key = shared.key.clone();
    let writer = tokio::spawn(async move {
        while let Some(plain) = out_rx.recv().await {
            let sealed = match writer_key.seal(&plain) {
                Ok(sealed) => sealed,
                Err(e) => {
                    log::error!("Failed to seal frame for {peer}: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Binary(sealed.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Reader task: waits until the owner has seen `Established`
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let reader_key = shared.key.clone();
    let events = shared.events.clone();
    let reader = tokio::spawn(async move {
        if go_rx.await.is_err() {
            return;
        }
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => match reader_key.open(&data) {
                    Ok(bytes) => {
                        let frame = LinkEvent::Frame {
                            peer,
                            link_id,
                            bytes,
                        };
                        if events.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("Discarding frame from {peer}: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        let _ = events.send(LinkEvent::Lost { peer, link_id }).await;
    });

    let established = LinkEvent::Established {
        peer,
        link_id,
        outbound: out_tx,
        tasks: [reader.abort_handle(), writer.abort_handle()],
    };
    if shared.events.send(established).await.is_ok() {
        let _ = go_tx.send(());
    } else {
        reader.abort();
        writer.abort();
    }
}
