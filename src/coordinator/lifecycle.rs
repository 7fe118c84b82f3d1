//! Engine lifecycle: start and shutdown.

use tracing::info;

use super::{EngineState, SyncEngine};
use crate::doc::CrdtDoc;
use crate::metrics::PhaseTimer;

impl<D: CrdtDoc> SyncEngine<D> {
    /// Start document peers, the blob loop, and awareness forwarders.
    ///
    /// Idempotent while running. A shut-down engine can be started again;
    /// queued document updates survive the restart.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        if self.state() == EngineState::Running {
            return;
        }
        info!("Starting workspace sync engine");

        {
            let _timer = PhaseTimer::new("doc_start");
            self.docs.start();
        }
        {
            let _timer = PhaseTimer::new("blob_start");
            self.blobs.start();
        }
        {
            let _timer = PhaseTimer::new("awareness_connect");
            self.awareness.connect();
        }

        self.set_state(EngineState::Running);
        info!(
            doc_peers = self.docs.peer_states().len(),
            blob_shadows = self.blobs.shadow_names().len(),
            "Workspace sync engine running"
        );
    }

    /// Stop everything. Waits for every background task to unwind.
    ///
    /// Local state (replica, awareness document, queued updates) is kept.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() != EngineState::Running {
            return;
        }
        info!("Shutting down workspace sync engine");
        self.set_state(EngineState::ShuttingDown);

        let _timer = PhaseTimer::new("shutdown");
        self.awareness.disconnect().await;
        self.blobs.stop().await;
        self.docs.stop().await;

        let pending: usize = self
            .docs
            .peer_states()
            .iter()
            .map(|p| p.pending_updates)
            .sum();
        info!(pending_updates = pending, "Workspace sync engine stopped");
    }

    fn set_state(&self, next: EngineState) {
        let _ = self.state.send(next);
        crate::metrics::set_engine_state(&next.to_string());
    }
}
