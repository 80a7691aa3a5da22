//! Replicated text document backed by a Yrs `Doc`.
//!
//! The merge itself belongs to yrs: applying the same set of updates in any
//! order converges to the same text, and re-applying an update is a no-op.
//! This wrapper only fixes the shared text name and turns yrs' encodings into
//! plain byte vectors for the wire.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::protocol::ReplicaId;

/// Name of the root text type holding the document body.
pub const TEXT_NAME: &str = "content";

/// Replica errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    #[error("Malformed update: {0}")]
    Decode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

/// One participant's view of the shared document.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    /// Empty replica writing as `replica_id`.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            doc: Doc::with_client_id(replica_id),
        }
    }

    /// Server-side replica initialised from stored plain text.
    pub fn seeded(content: &str) -> Self {
        let doc = Doc::new();
        if !content.is_empty() {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_NAME);
            text.insert(&mut txn, 0, content);
        }
        Self { doc }
    }

    /// Replica writing as `replica_id`, caught up to `snapshot`.
    pub fn from_snapshot(replica_id: ReplicaId, snapshot: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new(replica_id);
        replica.load_snapshot(snapshot)?;
        Ok(replica)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.doc.client_id()
    }

    /// Current plain-text content.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(TEXT_NAME)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Length in yrs offset units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(TEXT_NAME).map(|text| text.len(&txn)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a delta produced by another replica.
    ///
    /// A delta that fails to decode leaves the replica untouched.
    pub fn apply_remote_change(&self, delta: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(delta).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Insert `chunk` at `index` and return the delta to broadcast.
    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_NAME);
        let index = index.min(text.len(&txn));
        text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Remove `len` units starting at `index` and return the delta.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_NAME);
        let total = text.len(&txn);
        let index = index.min(total);
        let len = len.min(total - index);
        if len > 0 {
            text.remove_range(&mut txn, index, len);
        }
        txn.encode_update_v1()
    }

    /// Full opaque state, suitable for [`Replica::load_snapshot`].
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a full state produced by [`Replica::snapshot`].
    pub fn load_snapshot(&self, state: &[u8]) -> Result<(), ReplicaError> {
        self.apply_remote_change(state)
    }

    /// Encoded state vector, for asking a peer what we are missing.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that `state_vector` has not seen.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("replica_id", &self.replica_id())
            .field("len", &self.len())
            .finish()
    }
}
