//! Room fan-out inside the signaling relay.
//!
//! All members of one room share a tokio broadcast channel. Each routed frame
//! records its sender and (for `Signal`) its single recipient; member tasks
//! filter on that, so the hot path never takes the member lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::ReplicaId;
use tokio::sync::{broadcast, RwLock};

/// A pre-encoded relay frame on its way to room members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub from: ReplicaId,
    /// `None` = every member except `from`.
    pub to: Option<ReplicaId>,
    pub bytes: Vec<u8>,
}

impl Routed {
    /// Whether `member` should receive this frame.
    pub fn is_for(&self, member: &ReplicaId) -> bool {
        match self.to {
            Some(to) => to == *member,
            None => self.from != *member,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Why a member could not join a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRefused {
    Duplicate,
    Full,
}

/// Members of one (room, token) pair.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Routed>>,
    members: RwLock<HashSet<ReplicaId>>,
    capacity: usize,
    max_members: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the per-member backlog before a slow member starts
    /// losing frames.
    pub fn new(capacity: usize, max_members: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            max_members,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register `replica` and subscribe it to the room.
    pub async fn add_member(
        &self,
        replica: ReplicaId,
    ) -> Result<broadcast::Receiver<Arc<Routed>>, JoinRefused> {
        let mut members = self.members.write().await;
        if members.contains(&replica) {
            return Err(JoinRefused::Duplicate);
        }
        if members.len() >= self.max_members {
            return Err(JoinRefused::Full);
        }
        members.insert(replica);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_member(&self, replica: &ReplicaId) -> bool {
        self.members.write().await.remove(replica)
    }

    /// Fan out to every subscriber. Returns the number of receivers.
    pub fn broadcast(&self, routed: Routed) -> usize {
        let count = self.sender.send(Arc::new(routed)).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A member lagged and lost `n` frames.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, replica: &ReplicaId) -> bool {
        self.members.read().await.contains(replica)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room name plus join token. Peers with a different secret present a
/// different token and therefore never meet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub room: String,
    pub token: String,
}

/// Maps room keys to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomKey, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    max_members: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_members,
        }
    }

    /// Add `replica` to the room for `key`, creating the room on first join.
    ///
    /// Lookup and membership change happen under the room table lock, so a
    /// concurrent [`leave`](Self::leave) cannot drop a room someone just joined.
    pub async fn join(
        &self,
        key: &RoomKey,
        replica: ReplicaId,
    ) -> Result<(Arc<BroadcastGroup>, broadcast::Receiver<Arc<Routed>>), JoinRefused> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity, self.max_members)))
            .clone();
        match group.add_member(replica).await {
            Ok(receiver) => Ok((group, receiver)),
            Err(refused) => {
                if group.member_count().await == 0 {
                    rooms.remove(key);
                }
                Err(refused)
            }
        }
    }

    /// Remove `replica` from its room. Returns `true` if the room is now
    /// empty and was dropped.
    pub async fn leave(&self, key: &RoomKey, replica: &ReplicaId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(key).cloned() else {
            return false;
        };
        group.remove_member(replica).await;
        if group.member_count().await == 0 {
            rooms.remove(key);
            return true;
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
