//! Replica identity, operation ids and state vectors.
//!
//! Every replica stamps its operations with `(LocalClock, ReplicaId)`. The
//! clock is contiguous per replica (1, 2, 3, …), which lets a [`StateVector`]
//! summarise "everything seen so far" as one counter per replica.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of one editing session.
///
/// Created once at session start and never reused while the session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Fresh random replica id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (tests, deterministic fixtures).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Build from a `u128` (tests, deterministic fixtures).
    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty for logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Globally unique operation identity.
///
/// The derived `Ord` compares `clock` first, then `replica`; buffered
/// operations drain in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl OperationId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { clock, replica }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Per-replica counter used to stamp local operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalClock {
    current: u64,
}

impl LocalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by exactly one and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    /// Last issued value (0 before the first operation).
    pub fn current(&self) -> u64 {
        self.current
    }
}

/// Number of integrated operations per replica.
///
/// Since clocks are contiguous, `get(r)` is also the highest clock of `r`
/// that has been integrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, count: u64) {
        self.0.insert(replica, count);
    }

    /// True if `id` is covered by this vector.
    pub fn contains(&self, id: &OperationId) -> bool {
        id.clock <= self.get(&id.replica)
    }

    /// True if `other` knows operations this vector does not.
    pub fn is_behind(&self, other: &StateVector) -> bool {
        other.iter().any(|(replica, count)| self.get(replica) < *count)
    }

    /// Entries of `self` restricted to `replicas`.
    pub fn restricted_to<'a>(&self, replicas: impl IntoIterator<Item = &'a ReplicaId>) -> StateVector {
        let mut out = StateVector::new();
        for replica in replicas {
            let count = self.get(replica);
            if count > 0 {
                out.set(*replica, count);
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
