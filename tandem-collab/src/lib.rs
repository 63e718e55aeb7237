//! # tandem-collab — Peer-to-peer sync for Tandem
//!
//! Replicas of one room find each other through a signaling relay, then talk
//! directly over encrypted WebSocket links. The relay never sees document
//! content or connection offers in the clear.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   sealed offers   ┌─────────────┐   sealed offers   ┌─────────────┐
//! │  Session A  │ ◄───────────────► │ RelayServer │ ◄───────────────► │  Session B  │
//! └──────┬──────┘                   └─────────────┘                   └──────┬──────┘
//!        │                                                                   │
//!        │                 sealed PeerFrames (direct link)                   │
//!        └───────────────────────────────────────────────────────────────────┘
//!
//! Session = SyncEngine (Document + AwarenessStore) + PeerTransport + SignalingClient
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames (bincode-encoded `PeerFrame` / `RelayFrame`)
//! - [`crypto`] — Room key schedule and ChaCha20-Poly1305 sealing
//! - [`awareness`] — Versioned, expiring presence per replica
//! - [`backoff`] — Capped exponential reconnect delays
//! - [`broadcast`] — Room fan-out inside the relay
//! - [`relay`] — Signaling relay server
//! - [`signaling`] — Relay client: join, announce, discover
//! - [`transport`] — Direct encrypted peer links
//! - [`sync`] — Per-link sync state machine and flood routing
//! - [`session`] — The replica actor tying it all together

pub mod protocol;
pub mod crypto;
pub mod awareness;
pub mod backoff;
pub mod broadcast;
pub mod relay;
pub mod signaling;
pub mod transport;
pub mod sync;
pub mod session;

// Re-exports for convenience
pub use protocol::{ConnectionOffer, FrameKind, PeerFrame, ProtocolError, RejectReason, RelayFrame};
pub use crypto::{CryptoError, RoomKeys, SealingKey};
pub use awareness::{
    color_for, AwarenessChange, AwarenessError, AwarenessStore, AwarenessUpdate, FieldKind,
    PresenceField, PresenceState, RemoteOutcome,
};
pub use backoff::BackoffPolicy;
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomKey, RoomManager};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use signaling::{ConnectionState, SignalingClient, SignalingConfig, SignalingError, SignalingEvent};
pub use transport::{LinkState, LinkStats, PeerTransport, TransportConfig, TransportError, TransportEvent};
pub use sync::{Effects, Outbound, PeerSync, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncPhase};
pub use session::{SessionConfig, SessionError, SessionEvent, SessionHandle};
