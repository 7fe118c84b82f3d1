// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level error type.

use thiserror::Error;

use crate::doc::crdt::CrdtError;
use crate::source::traits::SourceError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    /// The operation was cancelled. Never reported as a failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error("peer '{source_name}' stopped: {reason}")]
    PeerFailed { source_name: String, reason: String },

    #[error("no peer named '{0}'")]
    UnknownPeer(String),

    #[error("a peer named '{0}' is already attached")]
    DuplicatePeer(String),

    /// The main peer is fixed for the lifetime of an engine.
    #[error("'{0}' is the main peer and cannot be detached")]
    MainPeer(String),
}

impl SyncError {
    /// Transient failures put a peer into `Retrying`; everything else stops it.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Source(e) => e.is_transient(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::from(SourceError::Transport("offline".into())).is_transient());
        assert!(!SyncError::from(SourceError::VersionMismatch("v9".into())).is_transient());
        assert!(!SyncError::from(CrdtError::Malformed("junk".into())).is_transient());
        assert!(!SyncError::Cancelled.is_transient());
        assert!(SyncError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_peer_failed_display() {
        let err = SyncError::PeerFailed {
            source_name: "cloud".into(),
            reason: "bad envelope".into(),
        };
        assert_eq!(err.to_string(), "peer 'cloud' stopped: bad envelope");
    }
}
