//! Replicated text document (sequence CRDT).
//!
//! Each character is an [`Element`] with a unique [`OperationId`], the id of
//! the element it was typed after (left origin) and the id of the element
//! that followed it at that moment (right origin). Elements are never
//! removed; deletion only sets a tombstone.
//!
//! ## Integration order
//!
//! ```text
//!   left origin ── [ concurrent siblings … ] ── right origin
//!                     ▲
//!                     └─ new element scans this region:
//!                        same left origin  → smaller OperationId goes first
//!                        origin inside the region → stays with that subtree
//! ```
//!
//! This is the YATA rule also used by Yjs. Operations are only integrated once
//! they are causally ready (previous clock of the same replica present, and
//! origins / delete target present); everything else waits in a pending
//! buffer, so the result does not depend on arrival order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;
use thiserror::Error;

use crate::edit::{coalesce, TextEdit};
use crate::id::{LocalClock, OperationId, ReplicaId, StateVector};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("position {position} out of bounds for length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("range of {length} at {position} out of bounds for length {len}")]
    RangeOutOfBounds {
        position: usize,
        length: usize,
        len: usize,
    },
    #[error("operation {0} carries the local replica id but was never issued locally")]
    ForeignLocalId(OperationId),
}

/// One character of document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: OperationId,
    /// Element this one was inserted after (`None` = document start).
    pub origin: Option<OperationId>,
    /// Element that followed `origin` at creation time (`None` = document end).
    pub right_origin: Option<OperationId>,
    pub content: char,
    /// Tombstone. Only ever goes false → true.
    pub deleted: bool,
}

/// A replicated edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert one element. The `deleted` flag of the carried element is
    /// ignored; deletion travels as its own operation.
    Insert(Element),
    /// Tombstone `target`. `id` is the delete's own identity.
    Delete { id: OperationId, target: OperationId },
}

impl Operation {
    pub fn id(&self) -> OperationId {
        match self {
            Operation::Insert(element) => element.id,
            Operation::Delete { id, .. } => *id,
        }
    }
}

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation (and possibly buffered ones it unblocked) was integrated.
    Integrated { edits: Vec<TextEdit> },
    /// Waiting for a causal dependency.
    Buffered,
    /// Already applied or already buffered.
    Duplicate,
}

impl ApplyOutcome {
    /// True unless the operation had been seen before.
    pub fn is_new(&self) -> bool {
        !matches!(self, ApplyOutcome::Duplicate)
    }
}

/// Position bound to a character rather than an index.
///
/// Survives concurrent edits: resolving it later yields the index where that
/// character is now (or would be, if it was deleted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    /// Just before this element.
    Before(OperationId),
    /// After the last character.
    End,
}

/// The local replica of the shared text.
#[derive(Debug)]
pub struct Document {
    replica: ReplicaId,
    clock: LocalClock,
    /// All elements in document order, tombstones included.
    elements: Vec<Element>,
    /// Ids of integrated inserts.
    inserted: HashSet<OperationId>,
    state: StateVector,
    /// Integrated operations per replica, indexed by `clock - 1`.
    log: HashMap<ReplicaId, Vec<Operation>>,
    /// Operations waiting for a dependency, ordered by id.
    pending: BTreeMap<OperationId, Operation>,
    visible: OnceLock<String>,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: LocalClock::new(),
            elements: Vec::new(),
            inserted: HashSet::new(),
            state: StateVector::new(),
            log: HashMap::new(),
            pending: BTreeMap::new(),
            visible: OnceLock::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Insert `content` so that it starts at visible index `position`.
    ///
    /// Applied locally before returning; the operations must then be
    /// broadcast.
    pub fn insert(&mut self, position: usize, content: &str) -> Result<Vec<Operation>, DocumentError> {
        let len = self.len();
        if position > len {
            return Err(DocumentError::PositionOutOfBounds { position, len });
        }

        let mut origin = match position {
            0 => None,
            p => self.visible_ids().nth(p - 1),
        };
        let right_origin = match origin {
            Some(id) => self.index_of(&id).and_then(|i| self.elements.get(i + 1)).map(|e| e.id),
            None => self.elements.first().map(|e| e.id),
        };

        let mut ops = Vec::with_capacity(content.len());
        for ch in content.chars() {
            let id = OperationId::new(self.replica, self.clock.tick());
            let element = Element {
                id,
                origin,
                right_origin,
                content: ch,
                deleted: false,
            };
            let op = Operation::Insert(element.clone());
            self.integrate_insert(element);
            self.record(op.clone());
            ops.push(op);
            origin = Some(id);
        }
        Ok(ops)
    }

    /// Delete `length` visible characters starting at `position`.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<Vec<Operation>, DocumentError> {
        let len = self.len();
        if position.checked_add(length).map_or(true, |end| end > len) {
            return Err(DocumentError::RangeOutOfBounds { position, length, len });
        }

        let targets: Vec<OperationId> = self.visible_ids().skip(position).take(length).collect();
        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let id = OperationId::new(self.replica, self.clock.tick());
            let op = Operation::Delete { id, target };
            self.integrate_delete(&target);
            self.record(op.clone());
            ops.push(op);
        }
        Ok(ops)
    }

    /// Apply a local edit expressed as a range edit.
    pub fn apply_edit(&mut self, edit: &TextEdit) -> Result<Vec<Operation>, DocumentError> {
        match edit {
            TextEdit::Insert { index, text } => self.insert(*index, text),
            TextEdit::Delete { index, len } => self.delete(*index, *len),
        }
    }

    /// Apply an operation from any source. Idempotent by operation id.
    pub fn apply(&mut self, op: Operation) -> Result<ApplyOutcome, DocumentError> {
        let id = op.id();
        if self.state.contains(&id) || self.pending.contains_key(&id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if id.replica == self.replica {
            return Err(DocumentError::ForeignLocalId(id));
        }

        self.pending.insert(id, op);
        let edits = self.drain_ready();
        if self.pending.contains_key(&id) {
            log::trace!("Buffered {id}: dependency missing");
            return Ok(ApplyOutcome::Buffered);
        }
        Ok(ApplyOutcome::Integrated { edits })
    }

    /// Text with tombstones skipped.
    pub fn visible_content(&self) -> String {
        self.visible
            .get_or_init(|| {
                self.elements
                    .iter()
                    .filter(|e| !e.deleted)
                    .map(|e| e.content)
                    .collect()
            })
            .clone()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All elements in document order, tombstones included.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    /// Integrated operations that `remote` has not seen, per replica in clock
    /// order.
    pub fn operations_since(&self, remote: &StateVector) -> Vec<Operation> {
        let mut replicas: Vec<&ReplicaId> = self.log.keys().collect();
        replicas.sort();

        let mut out = Vec::new();
        for replica in replicas {
            let have = remote.get(replica) as usize;
            if let Some(ops) = self.log.get(replica) {
                if have < ops.len() {
                    out.extend(ops[have..].iter().cloned());
                }
            }
        }
        out
    }

    /// Number of operations waiting on a dependency.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Anchor for visible index `index` (`index == len` anchors to the end).
    pub fn anchor_at(&self, index: usize) -> Result<Anchor, DocumentError> {
        let len = self.len();
        if index > len {
            return Err(DocumentError::PositionOutOfBounds { position: index, len });
        }
        Ok(self
            .visible_ids()
            .nth(index)
            .map(Anchor::Before)
            .unwrap_or(Anchor::End))
    }

    /// Current visible index of an anchor, `None` if its element is unknown.
    pub fn resolve(&self, anchor: &Anchor) -> Option<usize> {
        match anchor {
            Anchor::End => Some(self.len()),
            Anchor::Before(id) => {
                let at = self.index_of(id)?;
                Some(self.elements[..at].iter().filter(|e| !e.deleted).count())
            }
        }
    }

    fn visible_ids(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.elements.iter().filter(|e| !e.deleted).map(|e| e.id)
    }

    fn index_of(&self, id: &OperationId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == *id)
    }

    fn visible_index(&self, at: usize) -> usize {
        self.elements[..at].iter().filter(|e| !e.deleted).count()
    }

    fn is_ready(&self, op: &Operation) -> bool {
        let id = op.id();
        if id.clock != self.state.get(&id.replica) + 1 {
            return false;
        }
        let known = |dep: &Option<OperationId>| dep.map_or(true, |d| self.inserted.contains(&d));
        match op {
            Operation::Insert(element) => known(&element.origin) && known(&element.right_origin),
            Operation::Delete { target, .. } => self.inserted.contains(target),
        }
    }

    /// Integrate every buffered operation that has become ready.
    fn drain_ready(&mut self) -> Vec<TextEdit> {
        let mut edits = Vec::new();
        loop {
            let ready: Vec<OperationId> = self
                .pending
                .values()
                .filter(|op| self.is_ready(op))
                .map(Operation::id)
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                // An earlier op in this pass may have made a later one stale.
                let Some(op) = self.pending.get(&id) else { continue };
                if !self.is_ready(op) {
                    continue;
                }
                let Some(op) = self.pending.remove(&id) else { continue };
                match &op {
                    Operation::Insert(element) => {
                        let mut element = element.clone();
                        element.deleted = false;
                        let content = element.content;
                        let at = self.integrate_insert(element);
                        edits.push(TextEdit::insert(self.visible_index(at), content.to_string()));
                    }
                    Operation::Delete { target, .. } => {
                        if let Some(index) = self.integrate_delete(target) {
                            edits.push(TextEdit::delete(index, 1));
                        }
                    }
                }
                self.record(op);
            }
        }
        coalesce(edits)
    }

    fn record(&mut self, op: Operation) {
        let id = op.id();
        self.state.set(id.replica, id.clock);
        self.log.entry(id.replica).or_default().push(op);
    }

    /// Place `element` between its origins. Returns its index.
    fn integrate_insert(&mut self, element: Element) -> usize {
        let left = element.origin.and_then(|id| self.index_of(&id));
        let right = element
            .right_origin
            .and_then(|id| self.index_of(&id))
            .unwrap_or(self.elements.len());

        let mut dest = left.map_or(0, |i| i + 1);
        let mut before_origin: HashSet<OperationId> = HashSet::new();
        let mut conflicting: HashSet<OperationId> = HashSet::new();

        let mut i = dest;
        while i < right {
            let o = &self.elements[i];
            before_origin.insert(o.id);
            conflicting.insert(o.id);

            if o.origin == element.origin {
                // Siblings of one replica never meet here: the later one's
                // right origin bounds the scan before the earlier one.
                if o.id < element.id {
                    dest = i + 1;
                    conflicting.clear();
                } else if o.right_origin == element.right_origin {
                    break;
                }
            } else if let Some(o_origin) = o.origin.filter(|id| before_origin.contains(id)) {
                if !conflicting.contains(&o_origin) {
                    dest = i + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
            i += 1;
        }

        self.inserted.insert(element.id);
        self.elements.insert(dest, element);
        self.visible = OnceLock::new();
        dest
    }

    /// Tombstone `target`. Returns its visible index if it was visible.
    fn integrate_delete(&mut self, target: &OperationId) -> Option<usize> {
        let at = self.index_of(target)?;
        if self.elements[at].deleted {
            return None;
        }
        let visible = self.visible_index(at);
        self.elements[at].deleted = true;
        self.visible = OnceLock::new();
        Some(visible)
    }
}
