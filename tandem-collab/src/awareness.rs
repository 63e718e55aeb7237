//! Presence ("awareness") of the peers in a room.
//!
//! Each replica owns one [`PresenceState`] and publishes it with a version
//! number. Remote entries are accepted only with a strictly higher version and
//! expire when their owner stops renewing them.
//!
//! ```text
//! set_local_field()  ──► dirty ──► take_dirty() ──► AwarenessUpdate (flooded)
//!                                                        │
//! apply_remote() ◄──────────────────────────────────────-┘
//!      │  version > known?  valid payload?
//!      ▼
//! AwarenessChange ──► session event
//!
//! sweep_expired(now) / remove_on_disconnect() ──► AwarenessChange { state: None }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_core::{Anchor, ReplicaId};
use thiserror::Error;

/// Entries not renewed within this window are dropped.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AwarenessError {
    #[error("more than one {0:?} field")]
    DuplicateField(FieldKind),
    #[error("display name is empty")]
    EmptyName,
    #[error("display name has {0} characters")]
    NameTooLong(usize),
    #[error("invalid colour {0:?}, expected #rrggbb")]
    InvalidColor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Identity,
    Cursor,
    Selection,
}

/// One piece of presence information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceField {
    /// Who is editing. `color` is `#rrggbb`.
    Identity { name: String, color: String },
    /// Caret position.
    Cursor { anchor: Anchor },
    /// Selected range from `anchor` to `head`.
    Selection { anchor: Anchor, head: Anchor },
}

impl PresenceField {
    pub fn kind(&self) -> FieldKind {
        match self {
            PresenceField::Identity { .. } => FieldKind::Identity,
            PresenceField::Cursor { .. } => FieldKind::Cursor,
            PresenceField::Selection { .. } => FieldKind::Selection,
        }
    }
}

/// A replica's published presence. At most one field per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    fields: Vec<PresenceField>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity-only state with a colour derived from `replica`.
    pub fn with_identity(replica: ReplicaId, name: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.set(PresenceField::Identity {
            name: name.into(),
            color: color_for(replica),
        });
        state
    }

    /// Insert or replace the field of the same kind.
    pub fn set(&mut self, field: PresenceField) {
        let kind = field.kind();
        match self.fields.iter_mut().find(|f| f.kind() == kind) {
            Some(slot) => *slot = field,
            None => self.fields.push(field),
        }
    }

    pub fn remove(&mut self, kind: FieldKind) -> Option<PresenceField> {
        let at = self.fields.iter().position(|f| f.kind() == kind)?;
        Some(self.fields.remove(at))
    }

    pub fn get(&self, kind: FieldKind) -> Option<&PresenceField> {
        self.fields.iter().find(|f| f.kind() == kind)
    }

    pub fn fields(&self) -> &[PresenceField] {
        &self.fields
    }

    pub fn name(&self) -> Option<&str> {
        match self.get(FieldKind::Identity) {
            Some(PresenceField::Identity { name, .. }) => Some(name),
            _ => None,
        }
    }

    pub fn cursor(&self) -> Option<Anchor> {
        match self.get(FieldKind::Cursor) {
            Some(PresenceField::Cursor { anchor }) => Some(*anchor),
            _ => None,
        }
    }

    /// Check a payload received from the network.
    pub fn validate(&self) -> Result<(), AwarenessError> {
        let mut seen = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let kind = field.kind();
            if seen.contains(&kind) {
                return Err(AwarenessError::DuplicateField(kind));
            }
            seen.push(kind);

            if let PresenceField::Identity { name, color } = field {
                let len = name.chars().count();
                if name.trim().is_empty() {
                    return Err(AwarenessError::EmptyName);
                }
                if len > MAX_NAME_LEN {
                    return Err(AwarenessError::NameTooLong(len));
                }
                if !is_hex_color(color) {
                    return Err(AwarenessError::InvalidColor(color.clone()));
                }
            }
        }
        Ok(())
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Stable, vivid `#rrggbb` colour for a replica.
pub fn color_for(replica: ReplicaId) -> String {
    let hash = replica.as_uuid().as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    let to_byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Versioned state as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub replica: ReplicaId,
    pub version: u64,
    pub state: Option<PresenceState>,
}

/// A visible presence change. `state: None` means the replica is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub replica: ReplicaId,
    pub state: Option<PresenceState>,
}

/// Result of [`AwarenessStore::apply_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Stale, our own, or invalid. Nothing stored.
    Ignored,
    /// Stored. `change` is set when the visible state changed.
    Accepted { change: Option<AwarenessChange> },
}

impl RemoteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RemoteOutcome::Accepted { .. })
    }

    pub fn change(self) -> Option<AwarenessChange> {
        match self {
            RemoteOutcome::Accepted { change } => change,
            RemoteOutcome::Ignored => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    state: PresenceState,
    version: u64,
    last_seen: Instant,
}

/// Local presence plus everything known about remote replicas.
#[derive(Debug)]
pub struct AwarenessStore {
    local: ReplicaId,
    local_state: Option<PresenceState>,
    local_version: u64,
    local_updated: Instant,
    dirty: bool,
    remote: HashMap<ReplicaId, Entry>,
    /// Last accepted version per replica, kept after the entry is removed.
    versions: HashMap<ReplicaId, u64>,
    timeout: Duration,
}

impl AwarenessStore {
    pub fn new(local: ReplicaId) -> Self {
        Self::with_timeout(local, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(local: ReplicaId, timeout: Duration) -> Self {
        Self {
            local,
            local_state: None,
            local_version: 0,
            local_updated: Instant::now(),
            dirty: false,
            remote: HashMap::new(),
            versions: HashMap::new(),
            timeout,
        }
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local
    }

    pub fn local_state(&self) -> Option<&PresenceState> {
        self.local_state.as_ref()
    }

    /// Replace the whole local state.
    pub fn set_local_state(&mut self, state: PresenceState) -> Result<(), AwarenessError> {
        state.validate()?;
        self.local_state = Some(state);
        self.bump();
        Ok(())
    }

    /// Insert or replace one local field.
    pub fn set_local_field(&mut self, field: PresenceField) -> Result<(), AwarenessError> {
        let mut state = self.local_state.clone().unwrap_or_default();
        state.set(field);
        self.set_local_state(state)
    }

    /// Announce that the local replica is leaving.
    pub fn clear_local_state(&mut self) {
        if self.local_state.take().is_some() {
            self.bump();
        }
    }

    /// Re-publish the local state unchanged (keeps it alive on peers, and
    /// gets past the version they remembered for us).
    pub fn renew(&mut self) {
        if self.local_state.is_some() {
            self.bump();
        }
    }

    fn bump(&mut self) {
        self.local_version += 1;
        self.local_updated = Instant::now();
        self.dirty = true;
    }

    /// True once the local entry is older than half the timeout.
    pub fn needs_renewal(&self, now: Instant) -> bool {
        self.local_state.is_some()
            && now.saturating_duration_since(self.local_updated) >= self.timeout / 2
    }

    /// Pending local update, if the local state changed since the last call.
    pub fn take_dirty(&mut self) -> Option<AwarenessUpdate> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.local_update())
    }

    fn local_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            replica: self.local,
            version: self.local_version,
            state: self.local_state.clone(),
        }
    }

    /// Apply a peer's published state.
    ///
    /// Only a strictly newer version with a valid payload is accepted.
    pub fn apply_remote(
        &mut self,
        replica: ReplicaId,
        version: u64,
        state: Option<PresenceState>,
        now: Instant,
    ) -> RemoteOutcome {
        if replica == self.local {
            return RemoteOutcome::Ignored;
        }
        if self.versions.get(&replica).is_some_and(|known| version <= *known) {
            log::trace!("Stale awareness v{version} from {replica}");
            return RemoteOutcome::Ignored;
        }
        if let Some(state) = &state {
            if let Err(e) = state.validate() {
                log::warn!("Discarding awareness from {replica}: {e}");
                return RemoteOutcome::Ignored;
            }
        }

        self.versions.insert(replica, version);
        let change = match state {
            Some(state) => {
                let changed = self.remote.get(&replica).map_or(true, |e| e.state != state);
                self.remote.insert(
                    replica,
                    Entry {
                        state: state.clone(),
                        version,
                        last_seen: now,
                    },
                );
                changed.then_some(AwarenessChange {
                    replica,
                    state: Some(state),
                })
            }
            None => self
                .remote
                .remove(&replica)
                .map(|_| AwarenessChange { replica, state: None }),
        };
        RemoteOutcome::Accepted { change }
    }

    /// Drop every remote entry not renewed within the timeout.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<AwarenessChange> {
        let timeout = self.timeout;
        let expired: Vec<ReplicaId> = self
            .remote
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(r, _)| *r)
            .collect();

        expired
            .into_iter()
            .filter_map(|replica| {
                log::debug!("Awareness of {replica} timed out");
                self.remote.remove(&replica)?;
                Some(AwarenessChange { replica, state: None })
            })
            .collect()
    }

    /// The transport to `replica` closed.
    pub fn remove_on_disconnect(&mut self, replica: ReplicaId) -> Option<AwarenessChange> {
        self.remote
            .remove(&replica)
            .map(|_| AwarenessChange { replica, state: None })
    }

    /// Current versioned states, local first. Sent to peers that just synced.
    pub fn snapshot(&self) -> Vec<AwarenessUpdate> {
        let mut out = Vec::with_capacity(self.remote.len() + 1);
        if self.local_state.is_some() {
            out.push(self.local_update());
        }
        out.extend(self.remote.iter().map(|(replica, e)| AwarenessUpdate {
            replica: *replica,
            version: e.version,
            state: Some(e.state.clone()),
        }));
        out
    }

    pub fn get(&self, replica: &ReplicaId) -> Option<&PresenceState> {
        if *replica == self.local {
            return self.local_state.as_ref();
        }
        self.remote.get(replica).map(|e| &e.state)
    }

    /// Number of remote replicas currently present.
    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u128) -> ReplicaId {
        ReplicaId::from_u128(n)
    }

    fn identity(name: &str) -> PresenceState {
        let mut state = PresenceState::new();
        state.set(PresenceField::Identity {
            name: name.into(),
            color: "#30bced".into(),
        });
        state
    }

    #[test]
    fn test_set_replaces_same_kind() {
        let mut state = identity("Ada");
        state.set(PresenceField::Cursor { anchor: Anchor::End });
        state.set(PresenceField::Identity {
            name: "Grace".into(),
            color: "#ffffff".into(),
        });

        assert_eq!(state.fields().len(), 2);
        assert_eq!(state.name(), Some("Grace"));
        assert_eq!(state.cursor(), Some(Anchor::End));
    }

    #[test]
    fn test_validation() {
        assert!(identity("Ada").validate().is_ok());
        assert_eq!(identity("  ").validate(), Err(AwarenessError::EmptyName));
        assert_eq!(
            identity(&"x".repeat(65)).validate(),
            Err(AwarenessError::NameTooLong(65))
        );

        let bad_color = PresenceState {
            fields: vec![PresenceField::Identity {
                name: "Ada".into(),
                color: "red".into(),
            }],
        };
        assert!(matches!(bad_color.validate(), Err(AwarenessError::InvalidColor(_))));

        let duplicated = PresenceState {
            fields: vec![
                PresenceField::Cursor { anchor: Anchor::End },
                PresenceField::Cursor { anchor: Anchor::End },
            ],
        };
        assert_eq!(
            duplicated.validate(),
            Err(AwarenessError::DuplicateField(FieldKind::Cursor))
        );
    }

    #[test]
    fn test_color_for_is_stable_hex() {
        let id = replica(0x550e8400_e29b_41d4_a716_446655440000);
        let color = color_for(id);
        assert_eq!(color, color_for(id));
        assert!(is_hex_color(&color), "{color}");
        assert!(PresenceState::with_identity(id, "Ada").validate().is_ok());
    }

    #[test]
    fn test_local_updates_bump_version_and_mark_dirty() {
        let mut store = AwarenessStore::new(replica(1));
        assert!(store.take_dirty().is_none());

        store.set_local_state(identity("Ada")).unwrap();
        store.set_local_field(PresenceField::Cursor { anchor: Anchor::End }).unwrap();

        let update = store.take_dirty().unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.state.unwrap().fields().len(), 2);
        assert!(store.take_dirty().is_none());
    }

    #[test]
    fn test_invalid_local_state_rejected() {
        let mut store = AwarenessStore::new(replica(1));
        assert!(store.set_local_state(identity("")).is_err());
        assert!(store.local_state().is_none());
        assert!(store.take_dirty().is_none());
    }

    #[test]
    fn test_apply_remote_requires_newer_version() {
        let mut store = AwarenessStore::new(replica(1));
        let now = Instant::now();
        let peer = replica(2);

        let change = store.apply_remote(peer, 1, Some(identity("Bob")), now).change().unwrap();
        assert_eq!(change.state.unwrap().name(), Some("Bob"));

        assert_eq!(
            store.apply_remote(peer, 1, Some(identity("Eve")), now),
            RemoteOutcome::Ignored
        );
        assert_eq!(store.get(&peer).unwrap().name(), Some("Bob"));

        // Same content with a newer version only refreshes lastSeen.
        let renewal = store.apply_remote(peer, 2, Some(identity("Bob")), now);
        assert!(renewal.is_accepted());
        assert!(renewal.change().is_none());
        assert!(store.apply_remote(peer, 3, Some(identity("Robert")), now).change().is_some());
    }

    #[test]
    fn test_apply_remote_discards_invalid_payload() {
        let mut store = AwarenessStore::new(replica(1));
        assert_eq!(
            store.apply_remote(replica(2), 1, Some(identity("")), Instant::now()),
            RemoteOutcome::Ignored
        );
        assert_eq!(store.remote_len(), 0);
    }

    #[test]
    fn test_own_state_from_network_ignored() {
        let mut store = AwarenessStore::new(replica(1));
        assert_eq!(
            store.apply_remote(replica(1), 99, Some(identity("Me")), Instant::now()),
            RemoteOutcome::Ignored
        );
        assert_eq!(store.remote_len(), 0);
    }

    #[test]
    fn test_clean_leave_removes() {
        let mut store = AwarenessStore::new(replica(1));
        let now = Instant::now();
        store.apply_remote(replica(2), 1, Some(identity("Bob")), now);

        let change = store.apply_remote(replica(2), 2, None, now).change().unwrap();
        assert_eq!(change.state, None);
        assert_eq!(store.remote_len(), 0);

        // An older state arriving late does not resurrect it.
        assert!(!store.apply_remote(replica(2), 1, Some(identity("Bob")), now).is_accepted());
    }

    #[test]
    fn test_sweep_expired() {
        let mut store = AwarenessStore::with_timeout(replica(1), Duration::from_secs(30));
        let start = Instant::now();
        store.apply_remote(replica(2), 1, Some(identity("Bob")), start);
        store.apply_remote(replica(3), 1, Some(identity("Cy")), start + Duration::from_secs(20));

        assert!(store.sweep_expired(start + Duration::from_secs(30)).is_empty());

        let removed = store.sweep_expired(start + Duration::from_secs(31));
        assert_eq!(removed, vec![AwarenessChange { replica: replica(2), state: None }]);
        assert_eq!(store.remote_len(), 1);

        // Returning with a newer version brings it back.
        assert!(store
            .apply_remote(replica(2), 2, Some(identity("Bob")), start + Duration::from_secs(40))
            .change()
            .is_some());
    }

    #[test]
    fn test_remove_on_disconnect() {
        let mut store = AwarenessStore::new(replica(1));
        store.apply_remote(replica(2), 1, Some(identity("Bob")), Instant::now());
        assert!(store.remove_on_disconnect(replica(2)).is_some());
        assert!(store.remove_on_disconnect(replica(2)).is_none());
    }

    #[test]
    fn test_renewal_schedule() {
        let mut store = AwarenessStore::with_timeout(replica(1), Duration::from_secs(30));
        assert!(!store.needs_renewal(Instant::now() + Duration::from_secs(60)));

        store.set_local_state(identity("Ada")).unwrap();
        store.take_dirty();
        let now = Instant::now();
        assert!(!store.needs_renewal(now));
        assert!(store.needs_renewal(now + Duration::from_secs(16)));

        store.renew();
        assert_eq!(store.take_dirty().unwrap().version, 2);
    }

    #[test]
    fn test_snapshot_lists_local_and_remote() {
        let mut store = AwarenessStore::new(replica(1));
        store.set_local_state(identity("Ada")).unwrap();
        store.apply_remote(replica(2), 4, Some(identity("Bob")), Instant::now());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].replica, replica(1));
        assert_eq!(snapshot[1].version, 4);
    }
}
