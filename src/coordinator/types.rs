//! Public types for the workspace coordinator.

use std::sync::Arc;

use crate::doc::{PeerState, SyncStatus};
use crate::source::traits::{AwarenessSource, BlobSource, DocSource};

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Peers, blob loop and awareness forwarders are running
    Running,
    /// Graceful shutdown in progress (or finished)
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Every source a workspace syncs with.
///
/// The first source of each kind is the main one; the rest are shadows.
pub struct WorkspaceSources {
    pub doc_main: Arc<dyn DocSource>,
    pub doc_shadows: Vec<Arc<dyn DocSource>>,
    pub blob_main: Arc<dyn BlobSource>,
    pub blob_shadows: Vec<Arc<dyn BlobSource>>,
    pub awareness: Vec<Arc<dyn AwarenessSource>>,
}

/// Snapshot returned by [`super::SyncEngine::health_check()`].
///
/// Cheap to build: no source is contacted.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub state: EngineState,
    pub doc_status: SyncStatus,
    pub peers: Vec<PeerState>,
    /// Some peer is backing off after a transport failure
    pub retrying: bool,
    /// The main source has delivered the root document
    pub root_loaded: bool,
    /// First hard error reported by a peer
    pub error: Option<String>,
    pub blob_main: String,
    pub blob_shadows: Vec<String>,
    pub blob_loop_running: bool,
    pub awareness_connected: bool,
}

impl HealthCheck {
    /// Running with no peer stopped on a hard error.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == EngineState::Running && self.error.is_none()
    }
}
