// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document engine: one replica, one main peer, any number of shadow peers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use doc_sync_engine::{DocEngine, MemoryDocSource, OpLogDoc, SyncEngineConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), doc_sync_engine::SyncError> {
//! let cloud = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
//! let engine = DocEngine::<OpLogDoc>::new("workspace", cloud, Vec::new(), &SyncEngineConfig::default())?;
//!
//! engine.start();
//! engine.edit("workspace", |doc| doc.insert("hello"))?;
//! engine.wait_for_synced().await?;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::crdt::CrdtDoc;
use super::peer::{DocPeer, Fanout};
use super::replica::SyncedDocument;
use super::state::{DocEngineState, PeerReporter, PeerRole, PeerState, StatusBoard, SyncStatus};
use super::{DocChange, DocId, PendingUpdate, UpdateOrigin};
use crate::config::SyncEngineConfig;
use crate::error::SyncError;
use crate::queue::{PriorityAsyncQueue, SharedPriorityTarget};
use crate::resilience::retry::RetryConfig;
use crate::source::traits::DocSource;

struct PeerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct PeerEntry<D> {
    peer: Arc<DocPeer<D>>,
    task: Option<PeerTask>,
}

struct Peers<D> {
    started: bool,
    main: String,
    entries: HashMap<String, PeerEntry<D>>,
}

/// Keeps a [`SyncedDocument`] converging with every attached source.
pub struct DocEngine<D> {
    replica: Arc<SyncedDocument<D>>,
    fanout: Arc<Fanout>,
    board: Arc<StatusBoard>,
    priority: SharedPriorityTarget,
    peers: Mutex<Peers<D>>,
    retry: RetryConfig,
}

impl<D: CrdtDoc> DocEngine<D> {
    /// Create an engine around a fresh replica rooted at `root_id`.
    pub fn new(
        root_id: impl Into<DocId>,
        main: Arc<dyn DocSource>,
        shadows: Vec<Arc<dyn DocSource>>,
        config: &SyncEngineConfig,
    ) -> Result<Self, SyncError> {
        Self::with_replica(Arc::new(SyncedDocument::new(root_id)), main, shadows, config)
    }

    /// Create an engine around an existing replica.
    pub fn with_replica(
        replica: Arc<SyncedDocument<D>>,
        main: Arc<dyn DocSource>,
        shadows: Vec<Arc<dyn DocSource>>,
        config: &SyncEngineConfig,
    ) -> Result<Self, SyncError> {
        let engine = Self {
            replica,
            fanout: Arc::new(Fanout::default()),
            board: Arc::new(StatusBoard::new(config.queue_warn_depth)),
            priority: SharedPriorityTarget::new(),
            peers: Mutex::new(Peers {
                started: false,
                main: main.name().to_string(),
                entries: HashMap::new(),
            }),
            retry: config.retry(),
        };

        {
            let mut peers = engine.peers.lock();
            engine.attach(&mut peers, main, PeerRole::Main)?;
            for shadow in shadows {
                engine.attach(&mut peers, shadow, PeerRole::Shadow)?;
            }
        }
        Ok(engine)
    }

    /// Override the backoff used by peers attached from now on.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn attach(
        &self,
        peers: &mut Peers<D>,
        source: Arc<dyn DocSource>,
        role: PeerRole,
    ) -> Result<Arc<DocPeer<D>>, SyncError> {
        let name = source.name().to_string();
        if peers.entries.contains_key(&name) {
            return Err(SyncError::DuplicatePeer(name));
        }

        self.board.insert(PeerState::new(name.clone(), role));
        let peer = Arc::new(DocPeer::new(
            source,
            role,
            self.replica.clone(),
            self.fanout.clone(),
            PriorityAsyncQueue::new(self.priority.clone()),
            PeerReporter::new(name.clone(), self.board.clone()),
            self.retry.clone(),
        ));
        peers.entries.insert(
            name,
            PeerEntry {
                peer: peer.clone(),
                task: None,
            },
        );
        Ok(peer)
    }

    fn spawn(&self, entry: &mut PeerEntry<D>) {
        if entry.task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(entry.peer.clone().run(cancel.clone()));
        entry.task = Some(PeerTask { cancel, handle });
    }

    /// Start every peer loop. Peers that stopped on a hard error are restarted.
    ///
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(skip(self), fields(root = %self.replica.root_id()))]
    pub fn start(&self) {
        let mut peers = self.peers.lock();
        peers.started = true;
        self.board.set_started(true);
        for entry in peers.entries.values_mut() {
            self.spawn(entry);
        }
        info!(peers = peers.entries.len(), "Document engine started");
    }

    /// Stop every peer loop and wait for them to unwind.
    ///
    /// Queued updates stay queued and are pushed after the next `start()`.
    #[tracing::instrument(skip(self), fields(root = %self.replica.root_id()))]
    pub async fn stop(&self) {
        let tasks: Vec<PeerTask> = {
            let mut peers = self.peers.lock();
            peers.started = false;
            peers
                .entries
                .values_mut()
                .filter_map(|entry| entry.task.take())
                .collect()
        };

        for task in &tasks {
            task.cancel.cancel();
        }
        for task in tasks {
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Peer task ended abnormally");
            }
        }
        self.board.set_started(false);
        info!("Document engine stopped");
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.peers.lock().started
    }

    /// Attach a shadow source at runtime. Running peers are left alone.
    #[tracing::instrument(skip(self, source), fields(source = %source.name()))]
    pub fn add_peer(&self, source: Arc<dyn DocSource>) -> Result<(), SyncError> {
        let mut peers = self.peers.lock();
        let peer = self.attach(&mut peers, source, PeerRole::Shadow)?;
        if peers.started {
            if let Some(entry) = peers.entries.get_mut(peer.name()) {
                self.spawn(entry);
            }
        }
        info!("Peer attached");
        Ok(())
    }

    /// Detach a shadow source. Its pending updates are discarded.
    #[tracing::instrument(skip(self))]
    pub async fn remove_peer(&self, name: &str) -> Result<(), SyncError> {
        let entry = {
            let mut peers = self.peers.lock();
            if peers.main == name {
                return Err(SyncError::MainPeer(name.to_string()));
            }
            peers
                .entries
                .remove(name)
                .ok_or_else(|| SyncError::UnknownPeer(name.to_string()))?
        };

        self.fanout.detach(name);
        if let Some(task) = entry.task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Peer task ended abnormally");
            }
        }
        let dropped = entry.peer.pending_updates();
        self.board.remove(name);
        crate::metrics::set_queue_depth(name, 0);
        info!(dropped, "Peer detached");
        Ok(())
    }

    /// Run a local edit against `doc_id` and enqueue the resulting delta to every peer.
    ///
    /// The delta is queued before this returns, whatever the state of any source.
    pub fn edit<R, F>(&self, doc_id: &str, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut D) -> R,
    {
        let (result, delta) = self.replica.edit(doc_id, f)?;
        self.fanout.dispatch(None, doc_id, &delta);
        Ok(result)
    }

    /// Merge an update produced elsewhere in the application and enqueue it.
    pub fn apply_local_update(&self, doc_id: &str, update: &[u8]) -> Result<(), SyncError> {
        if self.replica.apply(doc_id, update, UpdateOrigin::Local)? {
            self.fanout.dispatch(None, doc_id, update);
        }
        Ok(())
    }

    pub fn read<R, F>(&self, doc_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&D) -> R,
    {
        self.replica.read(doc_id, f)
    }

    #[must_use]
    pub fn replica(&self) -> &Arc<SyncedDocument<D>> {
        &self.replica
    }

    /// Replica-changed notifications, local and remote.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DocChange> {
        self.replica.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.board.current().status
    }

    #[must_use]
    pub fn state(&self) -> DocEngineState {
        self.board.current()
    }

    /// Watch the derived engine state. A new value is published on every peer transition.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<DocEngineState> {
        self.board.subscribe()
    }

    #[must_use]
    pub fn peer_states(&self) -> Vec<PeerState> {
        self.board.current().peers
    }

    #[must_use]
    pub fn peer(&self, name: &str) -> Option<Arc<DocPeer<D>>> {
        self.peers.lock().entries.get(name).map(|e| e.peer.clone())
    }

    #[must_use]
    pub fn main_peer_name(&self) -> String {
        self.peers.lock().main.clone()
    }

    /// Wait until every peer is `Synced`.
    ///
    /// Fails as soon as any peer stops on a hard error.
    pub async fn wait_for_synced(&self) -> Result<(), SyncError> {
        self.wait_until(|state| state.status == SyncStatus::Synced).await
    }

    /// Wait until the main peer has loaded the root document.
    pub async fn wait_for_root_loaded(&self) -> Result<(), SyncError> {
        self.wait_until(|state| state.root_loaded).await
    }

    async fn wait_until<F>(&self, done: F) -> Result<(), SyncError>
    where
        F: Fn(&DocEngineState) -> bool,
    {
        let mut rx = self.board.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if let Some(failed) = state.peers.iter().find(|p| p.last_error.is_some()) {
                    return Err(SyncError::PeerFailed {
                        source_name: failed.source.clone(),
                        reason: failed.last_error.clone().unwrap_or_default(),
                    });
                }
                if done(&state) {
                    return Ok(());
                }
            }
            rx.changed().await.map_err(|_| SyncError::Cancelled)?;
        }
    }

    /// Let updates for `doc_id` jump every peer's queue.
    pub fn set_priority_doc(&self, doc_id: impl Into<DocId>) {
        let doc_id = doc_id.into();
        self.priority.set_rule(move |id| id == doc_id);
    }

    pub fn clear_priority(&self) {
        self.priority.clear_rule();
    }

    /// The rule shared by every peer queue of this engine.
    #[must_use]
    pub fn priority_target(&self) -> &SharedPriorityTarget {
        &self.priority
    }

    /// Updates still queued for `name`.
    #[must_use]
    pub fn pending_for(&self, name: &str) -> Vec<PendingUpdate> {
        self.peers
            .lock()
            .entries
            .get(name)
            .map(|e| e.peer.queued())
            .unwrap_or_default()
    }
}

impl<D> Drop for DocEngine<D> {
    fn drop(&mut self) {
        for entry in self.peers.get_mut().entries.values() {
            if let Some(task) = &entry.task {
                task.cancel.cancel();
            }
        }
    }
}
