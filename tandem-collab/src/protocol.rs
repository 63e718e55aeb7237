//! Binary wire protocol.
//!
//! Two frame families, both bincode-encoded (standard config), one frame per
//! WebSocket binary message:
//!
//! ```text
//!  peer ◄──── sealed PeerFrame ────► peer        (direct transport)
//!  peer ◄──── RelayFrame ──────────► relay      (signaling only)
//! ```
//!
//! `RelayFrame`s carry sealed `ConnectionOffer`s; the relay only routes them.
//! `PeerFrame`s are sealed as a whole before they hit the socket.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tandem_core::{Operation, ReplicaId, StateVector};
use thiserror::Error;

use crate::awareness::PresenceState;

/// Hard cap on an encoded frame.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Frame kinds, for logs and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 1,
    SyncStep1 = 2,
    SyncStep2 = 3,
    DocUpdate = 4,
    AwarenessUpdate = 5,
    Ping = 6,
    Pong = 7,
}

/// Frame exchanged directly between two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// First frame in each direction; proves knowledge of the room key.
    Hello { replica: ReplicaId },
    /// "This is what I have."
    SyncStep1 { state_vector: StateVector },
    /// Exactly the operations the requester's vector lacked.
    SyncStep2 { operations: Vec<Operation> },
    /// Live operations. `sender_state_vector_delta` holds the sender's vector
    /// entries for the replicas touched by `operations`.
    DocUpdate {
        operations: Vec<Operation>,
        sender_state_vector_delta: StateVector,
    },
    /// Presence of `replica`; `state = None` means it left.
    AwarenessUpdate {
        replica: ReplicaId,
        version: u64,
        state: Option<PresenceState>,
    },
    Ping,
    Pong,
}

impl PeerFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            PeerFrame::Hello { .. } => FrameKind::Hello,
            PeerFrame::SyncStep1 { .. } => FrameKind::SyncStep1,
            PeerFrame::SyncStep2 { .. } => FrameKind::SyncStep2,
            PeerFrame::DocUpdate { .. } => FrameKind::DocUpdate,
            PeerFrame::AwarenessUpdate { .. } => FrameKind::AwarenessUpdate,
            PeerFrame::Ping => FrameKind::Ping,
            PeerFrame::Pong => FrameKind::Pong,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Where a peer can be reached. Travels sealed through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOffer {
    pub replica: ReplicaId,
    pub listen_addr: SocketAddr,
}

impl ConnectionOffer {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Why the relay refused a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Another live connection in the room already uses this replica id.
    DuplicateReplica,
    RoomFull,
    /// First frame of a connection must be `Join`.
    ExpectedJoin,
}

/// Frame exchanged with the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Enter `room`. `token` is derived from the room secret, so peers with a
    /// different secret land in a different group.
    Join {
        room: String,
        token: String,
        replica: ReplicaId,
    },
    Leave,
    /// Sealed offer for every other member of the room.
    Announce { from: ReplicaId, sealed: Vec<u8> },
    /// Sealed offer for one member.
    Signal {
        from: ReplicaId,
        to: ReplicaId,
        sealed: Vec<u8>,
    },
    /// Relay-side notice that a member disconnected.
    PeerLeft { replica: ReplicaId },
    Rejected { reason: RejectReason },
    Ping,
    Pong,
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("unexpected {0:?} frame")]
    Unexpected(FrameKind),
}
