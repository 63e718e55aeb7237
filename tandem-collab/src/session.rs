//! A replica taking part in one room.
//!
//! One task owns the document, the presence store and every link. Callers
//! talk to it through a [`SessionHandle`] and listen on the event channel.
//!
//! ```text
//!   SessionHandle ──Command──┐
//!   SignalingClient ─event──┤
//!   PeerTransport ──event───┼──► select! ──► SyncEngine ──► Effects
//!   interval tick ──────────┘                                 │
//!                               PeerTransport::send ◄─────────┤
//!                               SessionEvent ◄────────────────┘
//! ```

use std::time::{Duration, Instant};
use tandem_core::{Anchor, DocumentError, ReplicaId, TextEdit};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessError, PresenceField, PresenceState};
use crate::backoff::BackoffPolicy;
use crate::crypto::{CryptoError, RoomKeys};
use crate::signaling::{SignalingClient, SignalingConfig, SignalingError, SignalingEvent};
use crate::sync::{Effects, Outbound, SyncConfig, SyncEngine, SyncError, SyncEvent};
use crate::transport::{PeerTransport, TransportConfig, TransportError, TransportEvent};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("another peer in the room uses this replica id")]
    DuplicateReplica,
    #[error(transparent)]
    Document(DocumentError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("session closed")]
    Closed,
}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::ForeignLocalId(_) => SessionError::DuplicateReplica,
            other => SessionError::Document(other),
        }
    }
}

impl From<SyncError> for SessionError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Document(e) => e.into(),
            SyncError::Awareness(e) => SessionError::Awareness(e),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Signaling relays, tried in turn
    pub relay_urls: Vec<String>,
    pub room: String,
    /// Shared room secret; never leaves this process
    pub secret: String,
    /// Published as presence identity when set
    pub display_name: Option<String>,
    /// Fixed replica id; random when `None`
    pub replica: Option<ReplicaId>,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub awareness_timeout: Duration,
    /// Reconnect policy for the relay
    pub relay_backoff: BackoffPolicy,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_urls: vec!["ws://127.0.0.1:4444".to_string()],
            room: "test-room".to_string(),
            secret: "password".to_string(),
            display_name: None,
            replica: None,
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            awareness_timeout: Duration::from_secs(30),
            relay_backoff: BackoffPolicy::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Events for the editor.
#[derive(Debug)]
pub enum SessionEvent {
    /// Apply these to the editor buffer, in order.
    RemoteEdits(Vec<TextEdit>),
    /// `state: None` means the replica left or timed out.
    AwarenessChanged {
        replica: ReplicaId,
        state: Option<PresenceState>,
    },
    PeerConnected(ReplicaId),
    PeerDisconnected(ReplicaId),
    /// The session stopped.
    Fatal(SessionError),
}

enum Command {
    LocalEdits {
        edits: Vec<TextEdit>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetPresence {
        field: PresenceField,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetCursor {
        index: usize,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Content {
        reply: oneshot::Sender<String>,
    },
    Resolve {
        anchor: Anchor,
        reply: oneshot::Sender<Option<usize>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<ReplicaId>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Caller's side of a running session.
pub struct SessionHandle {
    replica: ReplicaId,
    command_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Bind the peer listener, join the room and start the session task.
    pub async fn start(
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let replica = config.replica.unwrap_or_default();
        let keys = RoomKeys::derive(&config.room, &config.secret)?;

        let transport =
            PeerTransport::bind(replica, keys.channel().clone(), config.transport.clone()).await?;
        let (signaling, signal_rx) = SignalingClient::join(
            SignalingConfig {
                relay_urls: config.relay_urls.clone(),
                backoff: config.relay_backoff,
                ..SignalingConfig::default()
            },
            config.room.clone(),
            &keys,
            transport.offer(),
        )?;

        let mut engine = SyncEngine::new(
            replica,
            SyncConfig {
                heartbeat_interval: config.heartbeat_interval,
                liveness_timeout: config.liveness_timeout,
                awareness_timeout: config.awareness_timeout,
            },
        );
        if let Some(name) = &config.display_name {
            // No peers yet; published when the first link opens.
            engine.set_identity(name.clone())?;
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let actor = Actor {
            engine,
            transport,
            signaling: Some(signaling),
            signal_rx,
            command_rx,
            event_tx,
            tick: config.heartbeat_interval.min(Duration::from_secs(1)),
            rediscover: false,
        };
        log::info!("Session {replica} joining room {}", config.room);
        let task = tokio::spawn(actor.run());

        Ok((
            Self {
                replica,
                command_tx,
                task,
            },
            event_rx,
        ))
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Report edits the user made to the editor buffer, in order.
    pub async fn local_text_changed(&self, edits: Vec<TextEdit>) -> Result<(), SessionError> {
        self.request(|reply| Command::LocalEdits { edits, reply }).await?
    }

    pub async fn set_presence(&self, field: PresenceField) -> Result<(), SessionError> {
        self.request(|reply| Command::SetPresence { field, reply }).await?
    }

    /// Publish the caret at a visible index.
    pub async fn set_cursor(&self, index: usize) -> Result<(), SessionError> {
        self.request(|reply| Command::SetCursor { index, reply }).await?
    }

    pub async fn content(&self) -> Result<String, SessionError> {
        self.request(|reply| Command::Content { reply }).await
    }

    /// Current index of a remote cursor anchor.
    pub async fn resolve(&self, anchor: Anchor) -> Result<Option<usize>, SessionError> {
        self.request(|reply| Command::Resolve { anchor, reply }).await
    }

    /// Peers with an open link.
    pub async fn connected_peers(&self) -> Result<Vec<ReplicaId>, SessionError> {
        self.request(|reply| Command::Peers { reply }).await
    }

    /// Leave the room and release every connection.
    pub async fn close(self) -> Result<(), SessionError> {
        let _ = self.request(|reply| Command::Close { reply }).await;
        let _ = self.task.await;
        Ok(())
    }
}

struct Actor {
    engine: SyncEngine,
    transport: PeerTransport,
    signaling: Option<SignalingClient>,
    signal_rx: mpsc::Receiver<SignalingEvent>,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
    tick: Duration,
    /// A link was lost; re-announce on the next tick so the peer is found again.
    rediscover: bool,
}

impl Actor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut signaling_open = true;
        let mut closer = None;

        let fatal = loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Close { reply }) => {
                        closer = Some(reply);
                        break None;
                    }
                    Some(cmd) => self.command(cmd).await,
                    None => break None,
                },

                event = self.transport.next_event() => {
                    let Some(event) = event else { break None };
                    if let Err(e) = self.on_transport(event).await {
                        break Some(e);
                    }
                }

                event = self.signal_rx.recv(), if signaling_open => match event {
                    Some(event) => {
                        if let Err(e) = self.on_signaling(event) {
                            break Some(e);
                        }
                    }
                    None => {
                        log::warn!("Signaling stopped; no new peers will be found");
                        signaling_open = false;
                    }
                },

                _ = ticker.tick() => {
                    let effects = self.engine.tick(Instant::now());
                    self.dispatch(effects).await;
                    self.reannounce_if_needed();
                }
            }
        };

        let replica = self.engine.replica();
        if let Some(e) = fatal {
            log::error!("Session {replica} stopping: {e}");
            let _ = self.event_tx.send(SessionEvent::Fatal(e)).await;
        }

        // Cleanup
        let effects = self.engine.leave();
        self.dispatch(effects).await;
        if let Some(signaling) = self.signaling.take() {
            let _ = signaling.leave().await;
        }
        self.transport.shutdown();
        log::info!("Session {replica} closed");
        if let Some(reply) = closer {
            let _ = reply.send(());
        }
    }

    async fn command(&mut self, cmd: Command) {
        match cmd {
            Command::LocalEdits { edits, reply } => {
                let result = self.engine.local_edits(&edits);
                let _ = reply.send(self.finish(result).await);
            }
            Command::SetPresence { field, reply } => {
                let result = self.engine.set_presence(field);
                let _ = reply.send(self.finish(result).await);
            }
            Command::SetCursor { index, reply } => {
                let result = self.engine.set_cursor(index);
                let _ = reply.send(self.finish(result).await);
            }
            Command::Content { reply } => {
                let _ = reply.send(self.engine.document().visible_content());
            }
            Command::Resolve { anchor, reply } => {
                let _ = reply.send(self.engine.document().resolve(&anchor));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.transport.open_peers().collect());
            }
            // Handled by the loop
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn finish(&mut self, result: Result<Effects, SyncError>) -> Result<(), SessionError> {
        let effects = result?;
        self.dispatch(effects).await;
        Ok(())
    }

    async fn on_transport(&mut self, event: TransportEvent) -> Result<(), SessionError> {
        match event {
            TransportEvent::Opened { peer } => {
                self.emit(SessionEvent::PeerConnected(peer)).await;
                let effects = self.engine.peer_opened(peer, Instant::now());
                self.dispatch(effects).await;
            }
            TransportEvent::Message { peer, bytes } => {
                let effects = self.engine.handle_frame(peer, &bytes, Instant::now())?;
                self.dispatch(effects).await;
            }
            TransportEvent::Closed { peer } => {
                self.emit(SessionEvent::PeerDisconnected(peer)).await;
                let effects = self.engine.peer_closed(peer);
                self.dispatch(effects).await;
                self.rediscover = true;
            }
            TransportEvent::Unreachable { peer } => {
                log::info!("Giving up on {peer} until it is announced again");
                self.rediscover = true;
            }
        }
        Ok(())
    }

    fn on_signaling(&mut self, event: SignalingEvent) -> Result<(), SessionError> {
        match event {
            SignalingEvent::Connected => log::info!("Connected to signaling relay"),
            SignalingEvent::Disconnected => log::info!("Signaling relay lost; retrying"),
            SignalingEvent::PeerDiscovered { peer, offer } => {
                self.transport.connect(peer, offer);
            }
            SignalingEvent::PeerLeft(peer) => log::debug!("Relay reports {peer} left"),
            SignalingEvent::DuplicateReplica => return Err(SessionError::DuplicateReplica),
        }
        Ok(())
    }

    /// Execute engine output against the transport and the event channel.
    async fn dispatch(&mut self, effects: Effects) {
        for out in effects.outbound {
            match out {
                Outbound::Send { peer, frame } => match frame.encode() {
                    Ok(bytes) => {
                        if let Err(e) = self.transport.send(peer, bytes) {
                            log::debug!("Dropping {:?} for {peer}: {e}", frame.kind());
                        }
                    }
                    Err(e) => log::error!("Failed to encode {:?}: {e}", frame.kind()),
                },
                Outbound::Broadcast { except, frame } => match frame.encode() {
                    Ok(bytes) => {
                        self.transport.broadcast(&bytes, except);
                    }
                    Err(e) => log::error!("Failed to encode {:?}: {e}", frame.kind()),
                },
                Outbound::Disconnect { peer } => {
                    self.transport.close(peer);
                    self.emit(SessionEvent::PeerDisconnected(peer)).await;
                    self.rediscover = true;
                }
            }
        }

        for event in effects.events {
            let event = match event {
                SyncEvent::RemoteEdits(edits) => SessionEvent::RemoteEdits(edits),
                SyncEvent::AwarenessChanged(change) => SessionEvent::AwarenessChanged {
                    replica: change.replica,
                    state: change.state,
                },
                SyncEvent::PeerLive(peer) => {
                    log::debug!("{peer} is live");
                    continue;
                }
            };
            self.emit(event).await;
        }
    }

    fn reannounce_if_needed(&mut self) {
        if !std::mem::take(&mut self.rediscover) {
            return;
        }
        if let Some(signaling) = &self.signaling {
            if let Err(e) = signaling.reannounce() {
                log::debug!("Cannot re-announce: {e}");
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).await.is_err() {
            log::trace!("Session event dropped: receiver gone");
        }
    }
}
