// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-source sync loop.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped → LoadingRootDoc → LoadingSubDoc → Loaded → Syncing ⇄ Synced
//!                 └──────────────┴─────────────┴─────────┴──► Retrying ──► (back to the failed step)
//! ```
//!
//! A transport failure never drops work: the failing operation is retried
//! with backoff, and an update that was dequeued but not yet acknowledged is
//! put back at the head of the queue when the loop is cancelled.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::crdt::CrdtDoc;
use super::replica::SyncedDocument;
use super::state::{PeerReporter, PeerRole, PeerState, PeerStep};
use super::{DocId, PendingUpdate, UpdateOrigin};
use crate::error::SyncError;
use crate::queue::PriorityAsyncQueue;
use crate::resilience::retry::{sleep_or_cancel, RetryConfig};
use crate::source::traits::{DocSource, PulledDoc, RemoteUpdate, RemoteUpdates, SourceError};

/// One attached peer as seen by the fan-out.
pub(crate) struct PeerLink {
    name: String,
    queue: Arc<PriorityAsyncQueue<PendingUpdate>>,
    reporter: PeerReporter,
}

impl PeerLink {
    fn enqueue(&self, update: PendingUpdate) {
        self.queue.push([update]);
        self.reporter.pending(self.queue.len(), true);
    }
}

/// Delivers every replica change to every peer queue except its origin.
#[derive(Default)]
pub(crate) struct Fanout {
    links: RwLock<Vec<PeerLink>>,
}

impl Fanout {
    fn attach(&self, link: PeerLink) {
        let mut links = self.links.write();
        links.retain(|l| l.name != link.name);
        links.push(link);
    }

    pub(crate) fn detach(&self, name: &str) {
        self.links.write().retain(|l| l.name != name);
    }

    /// Enqueue synchronously on every peer but `origin`.
    pub(crate) fn dispatch(&self, origin: Option<&str>, doc_id: &str, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        for link in self.links.read().iter() {
            if origin == Some(link.name.as_str()) {
                continue;
            }
            link.enqueue(PendingUpdate::new(doc_id, payload.to_vec()));
        }
    }
}

/// The sync worker for one (replica, source) pair.
pub struct DocPeer<D> {
    source: Arc<dyn DocSource>,
    role: PeerRole,
    replica: Arc<SyncedDocument<D>>,
    fanout: Arc<Fanout>,
    queue: Arc<PriorityAsyncQueue<PendingUpdate>>,
    reporter: PeerReporter,
    retry: RetryConfig,
}

impl<D: CrdtDoc> DocPeer<D> {
    pub(crate) fn new(
        source: Arc<dyn DocSource>,
        role: PeerRole,
        replica: Arc<SyncedDocument<D>>,
        fanout: Arc<Fanout>,
        queue: PriorityAsyncQueue<PendingUpdate>,
        reporter: PeerReporter,
        retry: RetryConfig,
    ) -> Self {
        let queue = Arc::new(queue);
        fanout.attach(PeerLink {
            name: source.name().to_string(),
            queue: queue.clone(),
            reporter: reporter.clone(),
        });
        Self {
            source,
            role,
            replica,
            fanout,
            queue,
            reporter,
            retry,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.source.name()
    }

    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn pending_updates(&self) -> usize {
        self.queue.len()
    }

    /// Updates waiting to be pushed, head first.
    #[must_use]
    pub fn queued(&self) -> Vec<PendingUpdate> {
        self.queue.snapshot()
    }

    #[must_use]
    pub fn state(&self) -> Option<PeerState> {
        self.reporter.current()
    }

    /// Run until cancelled or a hard error.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(source = %self.name(), role = ?self.role, "Peer loop starting");
        let mut inflight: Option<PendingUpdate> = None;

        match self.sync_loop(&cancel, &mut inflight).await {
            Ok(()) | Err(SyncError::Cancelled) => {
                info!(source = %self.name(), "Peer loop stopped");
                self.reporter.step(PeerStep::Stopped);
            }
            Err(e) => {
                error!(source = %self.name(), error = %e, "Peer stopped on hard error");
                crate::metrics::record_peer_failure(self.name());
                self.reporter.failed(&e.to_string());
            }
        }

        if let Some(update) = inflight.take() {
            debug!(source = %self.name(), doc_id = %update.id, "Returning unsent update to queue");
            self.queue.push_front(update);
        }
        self.reporter.pending(self.queue.len(), false);
    }

    async fn sync_loop(
        &self,
        cancel: &CancellationToken,
        inflight: &mut Option<PendingUpdate>,
    ) -> Result<(), SyncError> {
        self.reporter.clear_error();
        self.reporter.step(PeerStep::LoadingRootDoc);

        let mut remote = self
            .attempt(cancel, "subscribe", || self.source.subscribe())
            .await?;

        let root_id = self.replica.root_id().to_string();
        self.load_doc(&root_id, cancel).await?;
        self.reporter.root_loaded();

        let mut loaded: HashSet<DocId> = HashSet::from([root_id]);
        self.reporter.step(PeerStep::LoadingSubDoc);
        self.load_sub_docs(&mut loaded, cancel).await?;
        self.reporter.step(PeerStep::Loaded);

        loop {
            if self.has_unloaded_sub_docs(&loaded) {
                self.reporter.step(PeerStep::Syncing);
                self.load_sub_docs(&mut loaded, cancel).await?;
            }

            if inflight.is_none() {
                self.reporter.settle(|| self.queue.is_empty());

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    update = remote.recv() => {
                        match update {
                            Some(update) => self.merge_remote(update, &loaded)?,
                            None => remote = self.resubscribe(cancel).await?,
                        }
                        continue;
                    }
                    next = self.queue.next(cancel) => {
                        *inflight = Some(self.coalesce(next?)?);
                        self.reporter.pending(self.queue.len(), false);
                    }
                }
            }

            let Some(update) = inflight.clone() else {
                continue;
            };
            self.reporter.step(PeerStep::Syncing);

            // Local state reflects the source before we offer our delta.
            if loaded.insert(update.id.clone()) {
                self.load_doc(&update.id, cancel).await?;
            } else {
                self.pull_and_merge(&update.id, cancel).await?;
            }

            self.attempt(cancel, "push", || self.source.push(&update.id, &update.payload))
                .await?;
            crate::metrics::record_bytes_pushed(self.name(), update.payload.len());
            debug!(source = %self.name(), doc_id = %update.id, bytes = update.payload.len(), "Pushed update");
            *inflight = None;
        }
    }

    /// Pull `doc_id`, merge what the source has, push what it lacks.
    async fn load_doc(&self, doc_id: &str, cancel: &CancellationToken) -> Result<(), SyncError> {
        let pulled = self.pull_and_merge(doc_id, cancel).await?;

        let missing = match &pulled {
            Some(PulledDoc { state, .. }) => self.replica.diff_since(doc_id, Some(state))?,
            None => self.replica.diff_since(doc_id, None)?,
        };
        if !missing.is_empty() {
            self.attempt(cancel, "push", || self.source.push(doc_id, &missing))
                .await?;
            crate::metrics::record_bytes_pushed(self.name(), missing.len());
        }
        debug!(source = %self.name(), doc_id, pushed = missing.len(), "Loaded document");
        Ok(())
    }

    async fn pull_and_merge(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PulledDoc>, SyncError> {
        let pulled = self
            .attempt(cancel, "pull", || {
                let state_vector = self.replica.state_vector(doc_id);
                async move { self.source.pull(doc_id, &state_vector).await }
            })
            .await?;

        if let Some(PulledDoc { data, .. }) = &pulled {
            if !data.is_empty() {
                self.merge(doc_id, data)?;
            }
        }
        Ok(pulled)
    }

    async fn load_sub_docs(
        &self,
        loaded: &mut HashSet<DocId>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        loop {
            let missing: Vec<DocId> = self
                .replica
                .sub_doc_ids()
                .into_iter()
                .filter(|id| !loaded.contains(id))
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            for doc_id in missing {
                self.load_doc(&doc_id, cancel).await?;
                loaded.insert(doc_id);
            }
        }
    }

    fn has_unloaded_sub_docs(&self, loaded: &HashSet<DocId>) -> bool {
        self.replica
            .sub_doc_ids()
            .iter()
            .any(|id| !loaded.contains(id))
    }

    fn merge_remote(&self, update: RemoteUpdate, loaded: &HashSet<DocId>) -> Result<(), SyncError> {
        if !loaded.contains(&update.doc_id) && !self.replica.contains(&update.doc_id) {
            debug!(source = %self.name(), doc_id = %update.doc_id, "Ignoring update for unreferenced document");
            return Ok(());
        }
        self.merge(&update.doc_id, &update.data)
    }

    fn merge(&self, doc_id: &str, data: &[u8]) -> Result<(), SyncError> {
        crate::metrics::record_bytes_pulled(self.name(), data.len());
        let changed = self
            .replica
            .apply(doc_id, data, UpdateOrigin::Remote(self.name().to_string()))?;
        if changed {
            self.fanout.dispatch(Some(self.name()), doc_id, data);
        }
        Ok(())
    }

    /// Fold every queued update for the same document into `first`.
    fn coalesce(&self, first: PendingUpdate) -> Result<PendingUpdate, SyncError> {
        let rest = self.queue.remove(|u| u.id == first.id);
        if rest.is_empty() {
            return Ok(first);
        }

        let mut payloads = Vec::with_capacity(rest.len() + 1);
        payloads.push(first.payload.clone());
        payloads.extend(rest.iter().map(|u| u.payload.clone()));

        match D::merge_updates(&payloads) {
            Ok(payload) => {
                debug!(source = %self.name(), doc_id = %first.id, merged = payloads.len(), "Coalesced queued updates");
                Ok(PendingUpdate {
                    id: first.id,
                    payload,
                    enqueued_at: first.enqueued_at,
                })
            }
            Err(e) => {
                for update in rest.into_iter().rev() {
                    self.queue.push_front(update);
                }
                self.queue.push_front(first);
                Err(e.into())
            }
        }
    }

    async fn resubscribe(&self, cancel: &CancellationToken) -> Result<RemoteUpdates, SyncError> {
        warn!(source = %self.name(), "Remote notification channel closed, resubscribing");
        self.reporter.retrying("notification channel closed");
        if !sleep_or_cancel(self.retry.initial_delay, cancel).await {
            return Err(SyncError::Cancelled);
        }
        let remote = self
            .attempt(cancel, "subscribe", || self.source.subscribe())
            .await?;
        self.reporter.step(PeerStep::Syncing);
        Ok(remote)
    }

    /// Run `op` until it succeeds, backing off in `Retrying` on transport errors.
    async fn attempt<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut backoff = self.retry.backoff();
        let mut resume: Option<PeerStep> = None;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = op() => result,
            };

            match result {
                Ok(value) => {
                    crate::metrics::record_source_op(self.name(), operation, "success");
                    if let Some(step) = resume {
                        info!(source = %self.name(), operation, attempts = backoff.attempts(), "Recovered after retries");
                        self.reporter.step(step);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    crate::metrics::record_source_op(self.name(), operation, "error");
                    if let Some(max) = self.retry.max_retries {
                        if backoff.attempts() + 1 >= max {
                            return Err(e.into());
                        }
                    }
                    if resume.is_none() {
                        resume = Some(
                            self.reporter
                                .current()
                                .map(|s| s.step)
                                .filter(|s| *s != PeerStep::Retrying)
                                .unwrap_or(PeerStep::Syncing),
                        );
                    }
                    self.reporter.retrying(&e.to_string());
                    if !sleep_or_cancel(backoff.next_delay(), cancel).await {
                        return Err(SyncError::Cancelled);
                    }
                }
                Err(e) => {
                    crate::metrics::record_source_op(self.name(), operation, "rejected");
                    return Err(e.into());
                }
            }
        }
    }
}
