//! Blob records and their derived transfer state.

use sha2::{Digest, Sha256};

/// Content key for `data`: lowercase hex SHA-256.
///
/// ```
/// use doc_sync_engine::blob_key;
///
/// assert_eq!(
///     blob_key(b"abc"),
///     "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
/// );
/// ```
#[must_use]
pub fn blob_key(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// An immutable attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub mime: String,
}

impl BlobRecord {
    #[must_use]
    pub fn new(key: impl Into<String>, data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data,
            mime: mime.into(),
        }
    }

    /// Record keyed by the hash of its content.
    #[must_use]
    pub fn from_content(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self::new(blob_key(&data), data, mime)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether this record fits under `limit` (no limit always fits).
    #[must_use]
    pub fn fits(&self, limit: Option<usize>) -> bool {
        limit.map_or(true, |limit| self.size() <= limit)
    }
}

/// Derived per-key transfer state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobState {
    pub uploading: bool,
    pub downloading: bool,
    /// Larger than some target source accepts; never retried until that changes.
    pub over_size: bool,
    /// Present locally, missing on a writable shadow.
    pub need_upload: bool,
    /// Missing on main, present on a shadow.
    pub need_download: bool,
    pub error_message: Option<String>,
}

impl BlobState {
    /// Fold a source-reported state into this one.
    pub(crate) fn merge_from(&mut self, other: &BlobState) {
        self.uploading |= other.uploading;
        self.downloading |= other.downloading;
        self.over_size |= other.over_size;
        if self.error_message.is_none() {
            self.error_message.clone_from(&other.error_message);
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobSyncReport {
    /// Distinct keys seen across all sources
    pub keys: usize,
    /// Copies made
    pub copied: usize,
    /// Copies skipped because the target's size limit is too small
    pub over_size: usize,
    /// Copies or listings that failed and will be retried next pass
    pub failed: usize,
}

impl BlobSyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
