//! CRDT replica of the shared text document.
//!
//! Wraps a single Yrs [`Doc`] holding one root text named `codetext`.
//! Every mutation is tagged with a [`MutationOrigin`] so observers can tell
//! edits made here apart from merged remote fragments:
//!
//! ```text
//!  local edit ──► mutate(ops, Local) ──┐
//!                                      ├──► Yrs Doc ──► observers(ReplicaChange)
//!  relay frame ─► apply_update(Remote)─┘
//! ```
//!
//! Indices and lengths are measured in UTF-16 code units so positions agree
//! with browser-based peers editing the same document.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared Editing
//! on Extensible Data Types" (YATA)

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

/// Name of the root text shared by every peer of a session.
pub const TEXT_NAME: &str = "codetext";

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOrigin {
    /// Edit performed by the local user.
    Local,
    /// Fragment or snapshot received from the relay.
    Remote,
    /// Undo or redo of earlier local edits.
    History,
}

impl MutationOrigin {
    /// Transaction origin tag recorded in the Yrs document.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::History => "history",
        }
    }
}

/// Encoded incremental update produced by one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFragment(pub Vec<u8>);

impl UpdateFragment {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encoded full state of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(pub Vec<u8>);

impl Snapshot {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A single text edit. Positions are UTF-16 code unit offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
}

impl EditOp {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        Self::Insert {
            index,
            text: text.into(),
        }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        Self::Delete { index, len }
    }
}

/// Notification delivered to replica observers after every successful
/// mutation or merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaChange {
    pub origin: MutationOrigin,
    pub fragment: UpdateFragment,
}


type ChangeObserver = Box<dyn FnMut(&ReplicaChange)>;

/// Replica errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to integrate update: {0}")]
    Apply(String),
    #[error("edit out of bounds: {op} at {index}+{len} exceeds length {doc_len}")]
    OutOfBounds {
        op: &'static str,
        index: u32,
        len: u32,
        doc_len: u32,
    },
    #[error("session context is no longer available")]
    Unavailable,
}

/// Owns the local CRDT document for one session.
pub struct ReplicaManager {
    doc: Doc,
    text: TextRef,
    observers: Vec<ChangeObserver>,
}

impl ReplicaManager {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            doc,
            text,
            observers: Vec::new(),
        }
    }

    /// Register an observer for every applied change.
    pub fn subscribe(&mut self, observer: impl FnMut(&ReplicaChange) + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Drop every registered observer.
    pub fn detach_all(&mut self) {
        self.observers.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Merge a full-state snapshot received from the relay.
    pub fn apply_snapshot(&mut self, snapshot: &[u8]) -> Result<(), ReplicaError> {
        self.apply_encoded(snapshot, MutationOrigin::Remote)
    }

    /// Merge an incremental update fragment. Commutative, associative and
    /// idempotent: duplicate or reordered fragments converge.
    pub fn apply_update(
        &mut self,
        fragment: &[u8],
        origin: MutationOrigin,
    ) -> Result<(), ReplicaError> {
        self.apply_encoded(fragment, origin)
    }

    fn apply_encoded(&mut self, bytes: &[u8], origin: MutationOrigin) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(bytes).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut_with(origin.tag());
            txn.apply_update(update)
                .map_err(|e| ReplicaError::Apply(format!("{e:?}")))?;
        }
        self.notify(ReplicaChange {
            origin,
            fragment: UpdateFragment(bytes.to_vec()),
        });
        Ok(())
    }

    /// Apply a batch of edits as one atomic transaction and return the
    /// resulting update fragment. The whole batch is validated up front;
    /// an out-of-bounds op rejects the batch without touching the document.
    pub fn mutate(
        &mut self,
        ops: &[EditOp],
        origin: MutationOrigin,
    ) -> Result<UpdateFragment, ReplicaError> {
        self.validate(ops)?;

        let fragment = {
            let mut txn = self.doc.transact_mut_with(origin.tag());
            for op in ops {
                match op {
                    EditOp::Insert { index, text } => self.text.insert(&mut txn, *index, text),
                    EditOp::Delete { index, len } => {
                        self.text.remove_range(&mut txn, *index, *len)
                    }
                }
            }
            UpdateFragment(txn.encode_update_v1())
        };

        self.notify(ReplicaChange {
            origin,
            fragment: fragment.clone(),
        });
        Ok(fragment)
    }

    /// Replace the whole text with `content` in one transaction.
    pub fn replace_content(
        &mut self,
        content: &str,
        origin: MutationOrigin,
    ) -> Result<UpdateFragment, ReplicaError> {
        let len = self.len();
        let mut ops = Vec::with_capacity(2);
        if len > 0 {
            ops.push(EditOp::delete(0, len));
        }
        if !content.is_empty() {
            ops.push(EditOp::insert(0, content));
        }
        self.mutate(&ops, origin)
    }

    /// Walk the batch against a running length so later ops see the effect
    /// of earlier ones.
    fn validate(&self, ops: &[EditOp]) -> Result<(), ReplicaError> {
        let mut doc_len = self.len();
        for op in ops {
            match op {
                EditOp::Insert { index, text } => {
                    if *index > doc_len {
                        return Err(ReplicaError::OutOfBounds {
                            op: "insert",
                            index: *index,
                            len: 0,
                            doc_len,
                        });
                    }
                    doc_len += utf16_len(text);
                }
                EditOp::Delete { index, len } => {
                    let end = index.checked_add(*len);
                    if end.map_or(true, |end| end > doc_len) {
                        return Err(ReplicaError::OutOfBounds {
                            op: "delete",
                            index: *index,
                            len: *len,
                            doc_len,
                        });
                    }
                    doc_len -= len;
                }
            }
        }
        Ok(())
    }

    /// Encode the full document state.
    pub fn encode_snapshot(&self) -> Snapshot {
        let txn = self.doc.transact();
        Snapshot(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    pub fn current_text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Everything integrated since `since`, encoded as one fragment.
    pub fn diff_since(&self, since: &StateVector) -> UpdateFragment {
        UpdateFragment(self.doc.transact().encode_state_as_update_v1(since))
    }

    /// The part of this replica that the peer which produced `snapshot`
    /// does not have yet, or `None` when it has everything.
    pub fn missing_from(&self, snapshot: &[u8]) -> Result<Option<UpdateFragment>, ReplicaError> {
        let remote = Update::decode_v1(snapshot).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let diff = self.diff_since(&remote.state_vector());
        let pending =
            Update::decode_v1(diff.as_bytes()).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok((!pending.is_empty()).then_some(diff))
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }

    pub(crate) fn text_ref(&self) -> &TextRef {
        &self.text
    }

    /// Announce a change that was applied through the document directly
    /// (undo and redo run their own transactions).
    pub(crate) fn record_change(&mut self, origin: MutationOrigin, fragment: UpdateFragment) {
        self.notify(ReplicaChange { origin, fragment });
    }

    fn notify(&mut self, change: ReplicaChange) {
        for observer in self.observers.iter_mut() {
            observer(&change);
        }
    }
}

impl Default for ReplicaManager {
    fn default() -> Self {
        Self::new()
    }
}

fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}
