// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Workspace coordinator.
//!
//! The [`SyncEngine`] ties together the three engines a workspace needs:
//! - [`DocEngine`]: the document replica and its peers
//! - [`BlobEngine`]: attachments reconciled across blob sources
//! - [`AwarenessEngine`]: ephemeral presence
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use doc_sync_engine::{
//!     EngineState, MemoryAwarenessHub, MemoryBlobSource, MemoryDocSource, OpLogDoc,
//!     SyncEngine, SyncEngineConfig, WorkspaceSources,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let hub = MemoryAwarenessHub::new();
//! let sources = WorkspaceSources {
//!     doc_main: Arc::new(MemoryDocSource::<OpLogDoc>::new("local")),
//!     doc_shadows: vec![Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"))],
//!     blob_main: Arc::new(MemoryBlobSource::new("local")),
//!     blob_shadows: vec![Arc::new(MemoryBlobSource::new("cloud"))],
//!     awareness: vec![Arc::new(hub.source("cloud"))],
//! };
//! let engine = SyncEngine::<OpLogDoc>::open("workspace", sources, &SyncEngineConfig::default())
//!     .expect("distinct source names");
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await;
//! engine.docs().edit("workspace", |doc| doc.insert("hello")).unwrap();
//! engine.docs().wait_for_synced().await.unwrap();
//! engine.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineState, HealthCheck, WorkspaceSources};

use std::sync::Arc;
use tokio::sync::watch;

use crate::awareness::{Awareness, AwarenessEngine};
use crate::blob::BlobEngine;
use crate::config::SyncEngineConfig;
use crate::doc::{CrdtDoc, DocEngine, DocId};
use crate::error::SyncError;

/// One workspace: documents, blobs and presence kept in sync together.
///
/// The engine is `Send + Sync`; every operation takes `&self`.
pub struct SyncEngine<D> {
    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) docs: DocEngine<D>,
    pub(super) blobs: Arc<BlobEngine>,
    pub(super) awareness: AwarenessEngine,
}

impl<D: CrdtDoc> SyncEngine<D> {
    /// Assemble an engine from already-built parts.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to begin syncing.
    pub fn new(docs: DocEngine<D>, blobs: BlobEngine, awareness: AwarenessEngine) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state(&EngineState::Created.to_string());
        Self {
            state: state_tx,
            state_rx,
            docs,
            blobs: Arc::new(blobs),
            awareness,
        }
    }

    /// Build the three engines for `root_id` from a set of sources.
    ///
    /// The awareness document gets a random client id.
    pub fn open(
        root_id: impl Into<DocId>,
        sources: WorkspaceSources,
        config: &SyncEngineConfig,
    ) -> Result<Self, SyncError> {
        let docs = DocEngine::new(root_id, sources.doc_main, sources.doc_shadows, config)?;
        let blobs = BlobEngine::new(sources.blob_main, sources.blob_shadows, config)?;
        let awareness = AwarenessEngine::new(Arc::new(Awareness::random()), sources.awareness);
        Ok(Self::new(docs, blobs, awareness))
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn docs(&self) -> &DocEngine<D> {
        &self.docs
    }

    pub fn blobs(&self) -> &Arc<BlobEngine> {
        &self.blobs
    }

    pub fn awareness(&self) -> &AwarenessEngine {
        &self.awareness
    }

    /// Snapshot of every engine's state. No source is contacted.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let docs = self.docs.state();
        HealthCheck {
            state: self.state(),
            doc_status: docs.status,
            peers: docs.peers,
            retrying: docs.retrying,
            root_loaded: docs.root_loaded,
            error: docs.error,
            blob_main: self.blobs.main_name().to_string(),
            blob_shadows: self.blobs.shadow_names(),
            blob_loop_running: self.blobs.is_running(),
            awareness_connected: self.awareness.is_connected(),
        }
    }
}
