//! Document and presence sync over the peer mesh.
//!
//! Each open link runs the same small state machine:
//!
//! ```text
//! Handshaking ──Hello ok──► Syncing ──SyncStep2──► Live
//!      │                       │                     │
//!      └───────────── silence > liveness ────────────┴──► Closed
//! ```
//!
//! `SyncEngine` is I/O free: it consumes frames, local edits and clock ticks,
//! and answers with [`Effects`] (frames to send, events to surface). The
//! session task executes them against the transport.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tandem_core::{
    coalesce, ApplyOutcome, Document, DocumentError, Operation, ReplicaId, StateVector, TextEdit,
};
use thiserror::Error;

use crate::awareness::{
    color_for, AwarenessChange, AwarenessError, AwarenessStore, AwarenessUpdate, PresenceField,
};
use crate::protocol::PeerFrame;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
}

/// Timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Ping period, also the minimum gap between catch-up requests
    pub heartbeat_interval: Duration,
    /// Silence after which a link is considered dead
    pub liveness_timeout: Duration,
    /// Remote presence expiry
    pub awareness_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            awareness_timeout: crate::awareness::DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Handshaking,
    Syncing,
    Live,
    Closed,
}

/// Result of a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Idle,
    SendPing,
    TimedOut,
}

/// Sync state of one link.
#[derive(Debug, Clone)]
pub struct PeerSync {
    peer: ReplicaId,
    phase: SyncPhase,
    last_heard: Instant,
    last_ping: Instant,
    last_catch_up: Option<Instant>,
}

impl PeerSync {
    pub fn new(peer: ReplicaId, now: Instant) -> Self {
        Self {
            peer,
            phase: SyncPhase::Handshaking,
            last_heard: now,
            last_ping: now,
            last_catch_up: None,
        }
    }

    pub fn peer(&self) -> ReplicaId {
        self.peer
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn handshake_complete(&mut self) {
        if self.phase == SyncPhase::Handshaking {
            self.phase = SyncPhase::Syncing;
        }
    }

    /// Returns `true` on the Syncing → Live transition.
    pub fn synced(&mut self) -> bool {
        if self.phase == SyncPhase::Syncing {
            self.phase = SyncPhase::Live;
            return true;
        }
        false
    }

    pub fn close(&mut self) {
        self.phase = SyncPhase::Closed;
    }

    /// Any inbound frame counts as a sign of life.
    pub fn heard(&mut self, now: Instant) {
        self.last_heard = now;
    }

    pub fn tick(&mut self, now: Instant, config: &SyncConfig) -> Heartbeat {
        if self.phase == SyncPhase::Closed {
            return Heartbeat::Idle;
        }
        if now.saturating_duration_since(self.last_heard) > config.liveness_timeout {
            return Heartbeat::TimedOut;
        }
        if now.saturating_duration_since(self.last_ping) >= config.heartbeat_interval {
            self.last_ping = now;
            return Heartbeat::SendPing;
        }
        Heartbeat::Idle
    }

    /// Rate limit for vector catch-up requests.
    pub fn may_catch_up(&mut self, now: Instant, interval: Duration) -> bool {
        let allowed = self
            .last_catch_up
            .map_or(true, |at| now.saturating_duration_since(at) >= interval);
        if allowed {
            self.last_catch_up = Some(now);
        }
        allowed
    }
}

/// A frame to put on the wire, or a link to drop.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send { peer: ReplicaId, frame: PeerFrame },
    /// To every open link except `except`.
    Broadcast {
        except: Option<ReplicaId>,
        frame: PeerFrame,
    },
    Disconnect { peer: ReplicaId },
}

/// Something the editor should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    RemoteEdits(Vec<TextEdit>),
    AwarenessChanged(AwarenessChange),
    /// Initial exchange with `peer` finished.
    PeerLive(ReplicaId),
}

/// What one engine call asks the caller to do.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub events: Vec<SyncEvent>,
}

impl Effects {
    fn send(&mut self, peer: ReplicaId, frame: PeerFrame) {
        self.outbound.push(Outbound::Send { peer, frame });
    }

    fn broadcast(&mut self, except: Option<ReplicaId>, frame: PeerFrame) {
        self.outbound.push(Outbound::Broadcast { except, frame });
    }

    fn event(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    fn extend(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}

fn awareness_frame(update: AwarenessUpdate) -> PeerFrame {
    PeerFrame::AwarenessUpdate {
        replica: update.replica,
        version: update.version,
        state: update.state,
    }
}

/// Reject an edit batch before any of it touches the document.
fn check_edits(mut len: usize, edits: &[TextEdit]) -> Result<(), DocumentError> {
    for edit in edits {
        match edit {
            TextEdit::Insert { index, text } => {
                if *index > len {
                    return Err(DocumentError::PositionOutOfBounds { position: *index, len });
                }
                len += text.chars().count();
            }
            TextEdit::Delete { index, len: length } => {
                if index.checked_add(*length).map_or(true, |end| end > len) {
                    return Err(DocumentError::RangeOutOfBounds {
                        position: *index,
                        length: *length,
                        len,
                    });
                }
                len -= length;
            }
        }
    }
    Ok(())
}

/// Document, presence and per-link sync state of one replica.
#[derive(Debug)]
pub struct SyncEngine {
    doc: Document,
    awareness: AwarenessStore,
    peers: HashMap<ReplicaId, PeerSync>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(replica: ReplicaId, config: SyncConfig) -> Self {
        Self {
            doc: Document::new(replica),
            awareness: AwarenessStore::with_timeout(replica, config.awareness_timeout),
            peers: HashMap::new(),
            config,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.doc.replica()
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn awareness(&self) -> &AwarenessStore {
        &self.awareness
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peer(&self, peer: &ReplicaId) -> Option<&PeerSync> {
        self.peers.get(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Apply edits the user made, in order, and broadcast the operations.
    pub fn local_edits(&mut self, edits: &[TextEdit]) -> Result<Effects, SyncError> {
        check_edits(self.doc.len(), edits)?;

        let mut operations = Vec::new();
        for edit in edits {
            operations.extend(self.doc.apply_edit(edit)?);
        }

        let mut effects = Effects::default();
        if operations.is_empty() {
            return Ok(effects);
        }
        let local = self.replica();
        effects.broadcast(
            None,
            PeerFrame::DocUpdate {
                operations,
                sender_state_vector_delta: self.doc.state_vector().restricted_to([&local]),
            },
        );
        Ok(effects)
    }

    pub fn set_presence(&mut self, field: PresenceField) -> Result<Effects, SyncError> {
        self.awareness.set_local_field(field)?;
        Ok(self.flush_awareness())
    }

    /// Publish a display name with this replica's colour.
    pub fn set_identity(&mut self, name: impl Into<String>) -> Result<Effects, SyncError> {
        self.set_presence(PresenceField::Identity {
            name: name.into(),
            color: color_for(self.replica()),
        })
    }

    /// Publish the caret at visible index `index`.
    pub fn set_cursor(&mut self, index: usize) -> Result<Effects, SyncError> {
        let anchor = self.doc.anchor_at(index)?;
        self.set_presence(PresenceField::Cursor { anchor })
    }

    fn flush_awareness(&mut self) -> Effects {
        let mut effects = Effects::default();
        if let Some(update) = self.awareness.take_dirty() {
            effects.broadcast(None, awareness_frame(update));
        }
        effects
    }

    /// The transport finished the handshake with `peer`.
    pub fn peer_opened(&mut self, peer: ReplicaId, now: Instant) -> Effects {
        let mut sync = PeerSync::new(peer, now);
        sync.handshake_complete();
        self.peers.insert(peer, sync);

        let mut effects = Effects::default();
        effects.send(
            peer,
            PeerFrame::SyncStep1 {
                state_vector: self.doc.state_vector(),
            },
        );

        // Fresh version, so a peer that remembers our old one accepts it.
        self.awareness.renew();
        effects.extend(self.flush_awareness());
        let local = self.replica();
        for update in self.awareness.snapshot() {
            if update.replica != local {
                effects.send(peer, awareness_frame(update));
            }
        }
        effects
    }

    pub fn peer_closed(&mut self, peer: ReplicaId) -> Effects {
        let mut effects = Effects::default();
        if let Some(mut sync) = self.peers.remove(&peer) {
            sync.close();
            log::debug!("Sync with {peer} closed");
        }
        if let Some(change) = self.awareness.remove_on_disconnect(peer) {
            effects.event(SyncEvent::AwarenessChanged(change));
        }
        effects
    }

    /// Handle one decrypted frame from `peer`.
    ///
    /// Undecodable frames are dropped. An error means this replica's id is
    /// in use elsewhere and the session cannot continue.
    pub fn handle_frame(
        &mut self,
        peer: ReplicaId,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Effects, SyncError> {
        let Some(sync) = self.peers.get_mut(&peer) else {
            log::debug!("Frame from {peer} without an open link");
            return Ok(Effects::default());
        };
        sync.heard(now);

        let frame = match PeerFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to decode frame from {peer}: {e}");
                return Ok(Effects::default());
            }
        };
        log::trace!("{:?} from {peer}", frame.kind());
        self.handle(peer, frame, now)
    }

    fn handle(
        &mut self,
        peer: ReplicaId,
        frame: PeerFrame,
        now: Instant,
    ) -> Result<Effects, SyncError> {
        let mut effects = Effects::default();
        match frame {
            PeerFrame::Hello { .. } => {
                log::debug!("Ignoring repeated Hello from {peer}");
            }

            PeerFrame::SyncStep1 { state_vector } => {
                effects.send(
                    peer,
                    PeerFrame::SyncStep2 {
                        operations: self.doc.operations_since(&state_vector),
                    },
                );
            }

            PeerFrame::SyncStep2 { operations } => {
                self.integrate(peer, operations, &mut effects)?;
                if self.peers.get_mut(&peer).is_some_and(PeerSync::synced) {
                    log::info!("Synced with {peer}");
                    effects.event(SyncEvent::PeerLive(peer));
                }
            }

            PeerFrame::DocUpdate {
                operations,
                sender_state_vector_delta,
            } => {
                self.integrate(peer, operations, &mut effects)?;
                self.maybe_catch_up(peer, &sender_state_vector_delta, now, &mut effects);
            }

            PeerFrame::AwarenessUpdate {
                replica,
                version,
                state,
            } => {
                let outcome = self
                    .awareness
                    .apply_remote(replica, version, state.clone(), now);
                if outcome.is_accepted() {
                    effects.broadcast(
                        Some(peer),
                        PeerFrame::AwarenessUpdate {
                            replica,
                            version,
                            state,
                        },
                    );
                }
                if let Some(change) = outcome.change() {
                    effects.event(SyncEvent::AwarenessChanged(change));
                }
            }

            PeerFrame::Ping => effects.send(peer, PeerFrame::Pong),
            PeerFrame::Pong => {}
        }
        Ok(effects)
    }

    /// Apply remote operations; flood the ones we had not seen.
    fn integrate(
        &mut self,
        from: ReplicaId,
        operations: Vec<Operation>,
        effects: &mut Effects,
    ) -> Result<(), SyncError> {
        let mut fresh = Vec::new();
        let mut edits = Vec::new();
        for op in operations {
            let outcome = self.doc.apply(op.clone())?;
            if !outcome.is_new() {
                continue;
            }
            if let ApplyOutcome::Integrated { edits: applied } = outcome {
                edits.extend(applied);
            }
            fresh.push(op);
        }

        if !edits.is_empty() {
            effects.event(SyncEvent::RemoteEdits(coalesce(edits)));
        }
        if !fresh.is_empty() {
            let touched: BTreeSet<ReplicaId> = fresh.iter().map(|op| op.id().replica).collect();
            effects.broadcast(
                Some(from),
                PeerFrame::DocUpdate {
                    sender_state_vector_delta: self.doc.state_vector().restricted_to(&touched),
                    operations: fresh,
                },
            );
        }
        Ok(())
    }

    /// Ask `peer` for a full diff if it knows operations we still lack.
    fn maybe_catch_up(
        &mut self,
        peer: ReplicaId,
        delta: &StateVector,
        now: Instant,
        effects: &mut Effects,
    ) {
        if !self.doc.state_vector().is_behind(delta) {
            return;
        }
        let interval = self.config.heartbeat_interval;
        let Some(sync) = self.peers.get_mut(&peer) else { return };
        if sync.may_catch_up(now, interval) {
            log::debug!("Behind {peer}; requesting catch-up");
            effects.send(
                peer,
                PeerFrame::SyncStep1 {
                    state_vector: self.doc.state_vector(),
                },
            );
        }
    }

    /// Heartbeats, liveness, presence expiry and renewal.
    pub fn tick(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        let mut dead = Vec::new();
        for (peer, sync) in self.peers.iter_mut() {
            match sync.tick(now, &self.config) {
                Heartbeat::SendPing => effects.send(*peer, PeerFrame::Ping),
                Heartbeat::TimedOut => dead.push(*peer),
                Heartbeat::Idle => {}
            }
        }
        for peer in dead {
            log::warn!("No frames from {peer} within {:?}", self.config.liveness_timeout);
            effects.outbound.push(Outbound::Disconnect { peer });
            effects.extend(self.peer_closed(peer));
        }

        for change in self.awareness.sweep_expired(now) {
            effects.event(SyncEvent::AwarenessChanged(change));
        }
        if self.awareness.needs_renewal(now) {
            self.awareness.renew();
        }
        effects.extend(self.flush_awareness());
        effects
    }

    /// Tell the peers we are going away.
    pub fn leave(&mut self) -> Effects {
        self.awareness.clear_local_state();
        self.flush_awareness()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    fn replica(i: usize) -> ReplicaId {
        ReplicaId::from_u128(i as u128 + 1)
    }

    fn index(id: ReplicaId) -> usize {
        id.as_uuid().as_u128() as usize - 1
    }

    /// In-memory mesh that routes effects between engines.
    struct Mesh {
        engines: Vec<SyncEngine>,
        links: HashSet<(usize, usize)>,
        queue: VecDeque<(usize, usize, Vec<u8>)>,
        events: Vec<Vec<SyncEvent>>,
        now: Instant,
    }

    impl Mesh {
        fn new(n: usize) -> Self {
            Self {
                engines: (0..n).map(|i| SyncEngine::new(replica(i), SyncConfig::default())).collect(),
                links: HashSet::new(),
                queue: VecDeque::new(),
                events: vec![Vec::new(); n],
                now: Instant::now(),
            }
        }

        fn connect(&mut self, a: usize, b: usize) {
            self.links.insert((a, b));
            self.links.insert((b, a));
            let now = self.now;
            let effects = self.engines[a].peer_opened(replica(b), now);
            self.route(a, effects);
            let effects = self.engines[b].peer_opened(replica(a), now);
            self.route(b, effects);
        }

        fn push(&mut self, from: usize, to: usize, frame: &PeerFrame) {
            if self.links.contains(&(from, to)) {
                self.queue.push_back((from, to, frame.encode().unwrap()));
            }
        }

        fn route(&mut self, from: usize, effects: Effects) {
            for out in effects.outbound {
                match out {
                    Outbound::Send { peer, frame } => self.push(from, index(peer), &frame),
                    Outbound::Broadcast { except, frame } => {
                        for to in 0..self.engines.len() {
                            if Some(replica(to)) != except {
                                self.push(from, to, &frame);
                            }
                        }
                    }
                    Outbound::Disconnect { .. } => {}
                }
            }
            self.events[from].extend(effects.events);
        }

        fn pump(&mut self) {
            while let Some((from, to, bytes)) = self.queue.pop_front() {
                let now = self.now;
                let effects = self.engines[to].handle_frame(replica(from), &bytes, now).unwrap();
                self.route(to, effects);
            }
        }

        fn edit(&mut self, at: usize, edit: TextEdit) {
            let effects = self.engines[at].local_edits(&[edit]).unwrap();
            self.route(at, effects);
        }

        fn content(&self, at: usize) -> String {
            self.engines[at].document().visible_content()
        }
    }

    #[test]
    fn test_initial_sync_and_live_phase() {
        let mut mesh = Mesh::new(2);
        mesh.edit(0, TextEdit::insert(0, "hello"));
        mesh.connect(0, 1);
        assert_eq!(mesh.engines[0].peer(&replica(1)).unwrap().phase(), SyncPhase::Syncing);

        mesh.pump();
        assert_eq!(mesh.content(1), "hello");
        assert_eq!(mesh.engines[0].peer(&replica(1)).unwrap().phase(), SyncPhase::Live);
        assert!(mesh.events[1].contains(&SyncEvent::RemoteEdits(vec![TextEdit::insert(0, "hello")])));
        assert!(mesh.events[1].contains(&SyncEvent::PeerLive(replica(0))));
    }

    #[test]
    fn test_updates_flood_through_intermediate_peer() {
        // 0 — 1 — 2, no direct link between 0 and 2.
        let mut mesh = Mesh::new(3);
        mesh.connect(0, 1);
        mesh.connect(1, 2);
        mesh.pump();

        mesh.edit(0, TextEdit::insert(0, "ab"));
        mesh.edit(2, TextEdit::insert(0, "c"));
        mesh.pump();

        let expected = mesh.content(0);
        assert_eq!(expected.chars().count(), 3);
        assert_eq!(mesh.content(1), expected);
        assert_eq!(mesh.content(2), expected);
    }

    #[test]
    fn test_lost_update_triggers_catch_up() {
        let mut mesh = Mesh::new(2);
        mesh.connect(0, 1);
        mesh.pump();

        mesh.edit(0, TextEdit::insert(0, "x"));
        mesh.queue.clear();
        mesh.edit(0, TextEdit::insert(1, "y"));
        mesh.pump();

        assert_eq!(mesh.content(1), "xy");
        assert_eq!(mesh.engines[1].document().pending_len(), 0);
    }

    #[test]
    fn test_catch_up_is_rate_limited() {
        let mut sync = PeerSync::new(replica(0), Instant::now());
        let now = Instant::now();
        let interval = Duration::from_secs(5);
        assert!(sync.may_catch_up(now, interval));
        assert!(!sync.may_catch_up(now + Duration::from_secs(1), interval));
        assert!(sync.may_catch_up(now + Duration::from_secs(6), interval));
    }

    #[test]
    fn test_awareness_reaches_peers_once() {
        let mut mesh = Mesh::new(3);
        mesh.connect(0, 1);
        mesh.connect(1, 2);
        mesh.connect(0, 2);
        mesh.pump();

        let effects = mesh.engines[0].set_identity("Ada").unwrap();
        mesh.route(0, effects);
        mesh.pump();

        for at in [1, 2] {
            let changes: Vec<_> = mesh.events[at]
                .iter()
                .filter(|e| matches!(e, SyncEvent::AwarenessChanged(c) if c.replica == replica(0)))
                .collect();
            assert_eq!(changes.len(), 1);
            assert_eq!(
                mesh.engines[at].awareness().get(&replica(0)).unwrap().name(),
                Some("Ada")
            );
        }
    }

    #[test]
    fn test_late_joiner_gets_presence_snapshot() {
        let mut mesh = Mesh::new(3);
        mesh.connect(0, 1);
        let effects = mesh.engines[0].set_identity("Ada").unwrap();
        mesh.route(0, effects);
        mesh.pump();

        mesh.connect(1, 2);
        mesh.pump();
        assert_eq!(
            mesh.engines[2].awareness().get(&replica(0)).unwrap().name(),
            Some("Ada")
        );
    }

    #[test]
    fn test_heartbeat_and_timeout() {
        let mut engine = SyncEngine::new(replica(0), SyncConfig::default());
        let start = Instant::now();
        engine.peer_opened(replica(1), start);
        let state = crate::awareness::PresenceState::with_identity(replica(1), "Bob");
        let frame = PeerFrame::AwarenessUpdate {
            replica: replica(1),
            version: 1,
            state: Some(state),
        };
        engine
            .handle_frame(replica(1), &frame.encode().unwrap(), start)
            .unwrap();

        assert!(engine.tick(start + Duration::from_secs(1)).outbound.is_empty());
        let ping = engine.tick(start + Duration::from_secs(5));
        assert_eq!(
            ping.outbound,
            vec![Outbound::Send { peer: replica(1), frame: PeerFrame::Ping }]
        );

        let dead = engine.tick(start + Duration::from_secs(16));
        assert!(dead.outbound.contains(&Outbound::Disconnect { peer: replica(1) }));
        assert_eq!(
            dead.events,
            vec![SyncEvent::AwarenessChanged(AwarenessChange { replica: replica(1), state: None })]
        );
        assert_eq!(engine.peer_count(), 0);
    }

    #[test]
    fn test_ping_answered_and_garbage_ignored() {
        let mut engine = SyncEngine::new(replica(0), SyncConfig::default());
        let now = Instant::now();
        engine.peer_opened(replica(1), now);

        let pong = engine
            .handle_frame(replica(1), &PeerFrame::Ping.encode().unwrap(), now)
            .unwrap();
        assert_eq!(
            pong.outbound,
            vec![Outbound::Send { peer: replica(1), frame: PeerFrame::Pong }]
        );

        let ignored = engine.handle_frame(replica(1), &[0xFF, 0xFE], now).unwrap();
        assert!(ignored.is_empty());
        // Unknown peers are ignored too.
        let ignored = engine
            .handle_frame(replica(7), &PeerFrame::Ping.encode().unwrap(), now)
            .unwrap();
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_operation_with_our_id_is_fatal() {
        let mut twin = Document::new(replica(0));
        let operations = twin.insert(0, "z").unwrap();

        let mut engine = SyncEngine::new(replica(0), SyncConfig::default());
        let now = Instant::now();
        engine.peer_opened(replica(1), now);
        let frame = PeerFrame::DocUpdate {
            operations,
            sender_state_vector_delta: StateVector::new(),
        };
        let result = engine.handle_frame(replica(1), &frame.encode().unwrap(), now);
        assert!(matches!(
            result,
            Err(SyncError::Document(DocumentError::ForeignLocalId(_)))
        ));
    }

    #[test]
    fn test_invalid_local_batch_changes_nothing() {
        let mut engine = SyncEngine::new(replica(0), SyncConfig::default());
        let edits = [TextEdit::insert(0, "ab"), TextEdit::delete(1, 5)];
        assert!(matches!(
            engine.local_edits(&edits),
            Err(SyncError::Document(DocumentError::RangeOutOfBounds { .. }))
        ));
        assert!(engine.document().is_empty());

        let effects = engine.local_edits(&[]).unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn test_leave_broadcasts_removal() {
        let mut engine = SyncEngine::new(replica(0), SyncConfig::default());
        engine.set_identity("Ada").unwrap();
        let effects = engine.leave();
        assert!(matches!(
            effects.outbound.as_slice(),
            [Outbound::Broadcast { except: None, frame: PeerFrame::AwarenessUpdate { state: None, .. } }]
        ));
    }
}
