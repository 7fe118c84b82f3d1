//! The CRDT collaborator contract.
//!
//! The engine never interprets document bytes itself. It only needs state
//! vectors, deltas against a state vector, commutative/idempotent update
//! application, and the list of sub-documents a document references.

use thiserror::Error;

use super::DocId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// Bytes that do not decode as an update or state vector.
    #[error("malformed update: {0}")]
    Malformed(String),
    /// Well-formed envelope from an incompatible encoder.
    #[error("unsupported update version {found} (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },
}

pub trait CrdtDoc: Default + Send + 'static {
    /// Encoded summary of every operation this replica has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Everything this replica has that `remote_state_vector` lacks.
    /// `None` diffs against the empty state (the whole document).
    /// An empty vec means there is nothing to send.
    fn diff_since(&self, remote_state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError>;

    /// Merge an update. Must be commutative and idempotent.
    fn apply_update(&mut self, update: &[u8]) -> Result<(), CrdtError>;

    /// Documents this document points at.
    fn sub_doc_ids(&self) -> Vec<DocId> {
        Vec::new()
    }

    /// Fold several updates into one equivalent update.
    fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, CrdtError>;
}
