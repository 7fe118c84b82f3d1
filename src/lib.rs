//! # Doc Sync Engine
//!
//! An offline-first engine that keeps a local CRDT replica converging with
//! any number of sources, plus the attachments and presence that go with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SyncEngine (workspace)                   │
//! │  • Created → Running → ShuttingDown                         │
//! └─────────────────────────────────────────────────────────────┘
//!          │                     │                      │
//!          ▼                     ▼                      ▼
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │    DocEngine     │  │    BlobEngine    │  │ AwarenessEngine  │
//! │ replica + peers  │  │ main + shadows   │  │ presence relay   │
//! │ one queue/source │  │ periodic sync    │  │ clock per client │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                     │                      │
//!          ▼                     ▼                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      Sources: SQLite cache, in-memory, remote servers       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Local edits are applied to the replica immediately and queued per source.
//! Each [`DocPeer`] loads the document from its source, pushes the queue, and
//! merges remote updates, backing off while its source is unreachable.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use doc_sync_engine::{DocEngine, MemoryDocSource, OpLogDoc, SyncEngineConfig, SyncStatus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let local = Arc::new(MemoryDocSource::<OpLogDoc>::new("local"));
//! let cloud = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
//! let engine = DocEngine::<OpLogDoc>::new(
//!     "workspace",
//!     local.clone(),
//!     vec![cloud.clone()],
//!     &SyncEngineConfig::for_tests(),
//! )
//! .unwrap();
//!
//! // Edits are accepted before (and regardless of) any source being reachable.
//! engine.edit("workspace", |doc| doc.insert("hello")).unwrap();
//! assert_eq!(engine.status(), SyncStatus::Stopped);
//!
//! engine.start();
//! engine.wait_for_synced().await.unwrap();
//! assert_eq!(cloud.texts("workspace"), vec!["hello".to_string()]);
//! engine.stop().await;
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the workspace [`SyncEngine`]
//! - [`doc`]: replica, peers, and the [`CrdtDoc`] contract
//! - [`blob`]: blob replication
//! - [`awareness`]: presence
//! - [`source`]: source traits, in-memory and SQLite sources
//! - [`queue`]: the update queues peers drain
//! - [`resilience`]: retry and backoff
//! - [`backpressure`]: queue pressure levels

pub mod awareness;
pub mod backpressure;
pub mod blob;
pub mod config;
pub mod coordinator;
pub mod doc;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod source;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use awareness::{Awareness, AwarenessChange, AwarenessChangeKind, AwarenessEngine, AwarenessUpdate};
pub use backpressure::BackpressureLevel;
pub use blob::{blob_key, BlobEngine, BlobRecord, BlobState, BlobSyncReport};
pub use config::SyncEngineConfig;
pub use coordinator::{EngineState, HealthCheck, SyncEngine, WorkspaceSources};
pub use doc::{
    CrdtDoc, CrdtError, DocChange, DocEngine, DocEngineState, DocId, DocPeer, OpLogDoc, PeerRole,
    PeerState, PeerStep, PendingUpdate, SyncStatus, SyncedDocument, UpdateOrigin,
};
pub use error::SyncError;
pub use queue::{AsyncQueue, Identified, PriorityAsyncQueue, SharedPriorityTarget};
pub use resilience::retry::RetryConfig;
pub use source::{
    AwarenessSource, BlobSource, DocSource, MemoryAwarenessHub, MemoryAwarenessSource, MemoryBlobSource,
    MemoryDocSource, PulledDoc, RemoteUpdate, RemoteUpdates, SourceError, SqliteCacheSource,
};
