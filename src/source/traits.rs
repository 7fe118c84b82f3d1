//! Contracts every transport/storage backend implements.
//!
//! A source is anything that can hold a copy of the document set, the blob
//! set, or relay presence: the local SQLite cache, an in-memory store, a
//! broadcast channel between tabs, a cloud backend. Engines only ever talk to
//! sources through these traits.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::awareness::AwarenessUpdate;
use crate::blob::{BlobRecord, BlobState};
use crate::doc::DocId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Network/storage failure. Retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// The record does not fit into the source.
    #[error("blob '{key}' is {size} bytes, source limit is {limit}")]
    Capacity { key: String, size: usize, limit: usize },
    /// The source holds data in a shape this engine cannot apply.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),
    /// Write attempted against a readonly source.
    #[error("source '{0}' is readonly")]
    ReadOnly(String),
}

impl SourceError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result of pulling a document from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledDoc {
    /// Delta to merge into the local replica. Empty when nothing is missing.
    pub data: Vec<u8>,
    /// The source's state vector for this document.
    pub state: Vec<u8>,
}

/// A delta the source received from somebody else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub doc_id: DocId,
    pub data: Vec<u8>,
}

/// Remote notification channel. Dropping it unsubscribes.
pub type RemoteUpdates = mpsc::UnboundedReceiver<RemoteUpdate>;

#[async_trait]
pub trait DocSource: Send + Sync {
    /// Unique name among the sources attached to one engine.
    fn name(&self) -> &str;

    /// Fetch what the source has that `state_vector` has not seen.
    /// `None` means the source does not know the document at all.
    async fn pull(&self, doc_id: &str, state_vector: &[u8]) -> Result<Option<PulledDoc>, SourceError>;

    async fn push(&self, doc_id: &str, data: &[u8]) -> Result<(), SourceError>;

    /// Open a push-based notification channel for remote changes.
    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError>;
}

#[async_trait]
pub trait BlobSource: Send + Sync {
    fn name(&self) -> &str;

    /// Readonly sources are only ever downloaded from.
    fn readonly(&self) -> bool {
        false
    }

    /// Largest blob this source accepts, in bytes.
    fn max_blob_size(&self) -> Option<usize> {
        None
    }

    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, SourceError>;

    async fn set(&self, blob: BlobRecord) -> Result<String, SourceError>;

    async fn delete(&self, key: &str) -> Result<(), SourceError>;

    async fn list(&self) -> Result<Vec<String>, SourceError>;

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Distinct "push to remote" step for sources that persist locally first.
    /// `None` means the source has no such step and `set` is already final.
    async fn upload(&self, _key: &str) -> Result<Option<bool>, SourceError> {
        Ok(None)
    }

    /// Source-side view of a blob's transfer state, if the source tracks one.
    fn blob_state(&self, _key: &str) -> Option<watch::Receiver<BlobState>> {
        None
    }
}

#[async_trait]
pub trait AwarenessSource: Send + Sync {
    fn name(&self) -> &str;

    /// Best effort. Losing a presence update is acceptable.
    async fn broadcast(&self, update: &AwarenessUpdate) -> Result<(), SourceError>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AwarenessUpdate>;
}
