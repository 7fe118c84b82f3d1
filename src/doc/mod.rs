// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document synchronization.
//!
//! ```text
//!   edit() ──► SyncedDocument ──► fan-out ──► peer queue (main)   ──► DocPeer ──► DocSource
//!                   ▲                    └──► peer queue (shadow) ──► DocPeer ──► DocSource
//!                   └──────────── remote merges (fanned out to the other peers) ◄─┘
//! ```
//!
//! - [`SyncedDocument`]: the local replica (root document plus sub-documents)
//! - [`DocPeer`]: one sync loop per (replica, source)
//! - [`DocEngine`]: owns the replica and its peers, aggregates their state

pub mod crdt;
pub mod engine;
pub mod oplog;
pub mod peer;
pub mod replica;
pub mod state;

pub use crdt::{CrdtDoc, CrdtError};
pub use engine::DocEngine;
pub use oplog::OpLogDoc;
pub use peer::DocPeer;
pub use replica::SyncedDocument;
pub use state::{DocEngineState, PeerRole, PeerState, PeerStep, SyncStatus};

use crate::queue::Identified;

pub type DocId = String;

/// A local delta waiting to be pushed to one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub id: DocId,
    pub payload: Vec<u8>,
    /// Epoch millis
    pub enqueued_at: u64,
}

impl PendingUpdate {
    #[must_use]
    pub fn new(id: impl Into<DocId>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
            enqueued_at: now_millis(),
        }
    }
}

impl Identified for PendingUpdate {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Who produced a change to the replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    /// Merged from the named source.
    Remote(String),
}

/// Emitted whenever the replica changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub doc_id: DocId,
    pub origin: UpdateOrigin,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
