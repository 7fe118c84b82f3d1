// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blob engine: one main blob source plus shadows.
//!
//! Blobs are immutable by key, so there is no convergence state machine:
//! a key is synced once it is present on every writable source it fits in.
//! Reconciliation runs as one-shot [`BlobEngine::sync`] passes, either on
//! demand or from the background loop started by [`BlobEngine::start`].

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{BlobRecord, BlobState, BlobSyncReport};
use crate::config::SyncEngineConfig;
use crate::error::SyncError;
use crate::queue::SharedPriorityTarget;
use crate::resilience::retry::{sleep_or_cancel, RetryConfig};
use crate::source::traits::{BlobSource, SourceError};

struct Tracked {
    /// What the engine itself knows; source-reported state is folded in on publish.
    local: BlobState,
    tx: Arc<watch::Sender<BlobState>>,
}

/// Per-key state registry shared with the source watchers.
///
/// A key is tracked only while it has a subscriber or a non-default state.
struct BlobStates {
    sources: Vec<Arc<dyn BlobSource>>,
    map: DashMap<String, Tracked>,
}

impl BlobStates {
    fn merged(&self, key: &str, local: &BlobState) -> BlobState {
        let mut state = local.clone();
        for source in &self.sources {
            if let Some(rx) = source.blob_state(key) {
                state.merge_from(&rx.borrow());
            }
        }
        state
    }

    fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut BlobState),
    {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let tracked = entry.get_mut();
                f(&mut tracked.local);
                let next = self.merged(key, &tracked.local);
                tracked.tx.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
                if tracked.local == BlobState::default() && tracked.tx.receiver_count() == 0 {
                    entry.remove();
                }
            }
            Entry::Vacant(entry) => {
                let mut local = BlobState::default();
                f(&mut local);
                if local != BlobState::default() {
                    let (tx, _) = watch::channel(self.merged(key, &local));
                    entry.insert(Tracked {
                        local,
                        tx: Arc::new(tx),
                    });
                }
            }
        }
    }

    fn republish(&self, key: &str) {
        if self.map.contains_key(key) {
            self.update(key, |_| {});
        }
    }

    /// Returns the receiver, plus the sender when nobody was watching the key
    /// before and its watchers need starting.
    fn subscribe(&self, key: &str) -> (watch::Receiver<BlobState>, Option<Arc<watch::Sender<BlobState>>>) {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let tx = &entry.get().tx;
                let idle = tx.receiver_count() == 0;
                (tx.subscribe(), idle.then(|| tx.clone()))
            }
            Entry::Vacant(entry) => {
                let local = BlobState::default();
                let (tx, rx) = watch::channel(self.merged(key, &local));
                let tx = Arc::new(tx);
                entry.insert(Tracked { local, tx: tx.clone() });
                (rx, Some(tx))
            }
        }
    }

    /// Forget `key` once nobody watches it and the engine has nothing to say about it.
    fn release(&self, key: &str) {
        self.map
            .remove_if(key, |_, t| t.tx.receiver_count() == 0 && t.local == BlobState::default());
    }

    fn current(&self, key: &str) -> BlobState {
        self.map
            .get(key)
            .map(|t| t.tx.borrow().clone())
            .unwrap_or_else(|| self.merged(key, &BlobState::default()))
    }
}

struct LoopTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BlobEngine {
    main: Arc<dyn BlobSource>,
    shadows: Vec<Arc<dyn BlobSource>>,
    states: Arc<BlobStates>,
    priority: SharedPriorityTarget,
    retry: RetryConfig,
    interval: Option<Duration>,
    task: Mutex<Option<LoopTask>>,
    watchers: CancellationToken,
}

impl BlobEngine {
    pub fn new(
        main: Arc<dyn BlobSource>,
        shadows: Vec<Arc<dyn BlobSource>>,
        config: &SyncEngineConfig,
    ) -> Result<Self, SyncError> {
        let mut names = HashSet::new();
        for source in std::iter::once(&main).chain(shadows.iter()) {
            if !names.insert(source.name().to_string()) {
                return Err(SyncError::DuplicatePeer(source.name().to_string()));
            }
        }

        let sources = std::iter::once(main.clone()).chain(shadows.iter().cloned()).collect();
        Ok(Self {
            main,
            shadows,
            states: Arc::new(BlobStates {
                sources,
                map: DashMap::new(),
            }),
            priority: SharedPriorityTarget::new(),
            retry: config.retry(),
            interval: config.blob_sync_interval(),
            task: Mutex::new(None),
            watchers: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn main_name(&self) -> &str {
        self.main.name()
    }

    #[must_use]
    pub fn shadow_names(&self) -> Vec<String> {
        self.shadows.iter().map(|s| s.name().to_string()).collect()
    }

    fn sources(&self) -> impl Iterator<Item = &Arc<dyn BlobSource>> {
        std::iter::once(&self.main).chain(self.shadows.iter())
    }

    /// Main first, then shadows in order. A shadow hit is cached into main.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<BlobRecord>, SyncError> {
        let mut first_error: Option<SourceError> = None;

        match self.main.get(key).await {
            Ok(Some(record)) => {
                crate::metrics::record_source_op(self.main.name(), "get", "success");
                return Ok(Some(record));
            }
            Ok(None) => {}
            Err(e) => {
                crate::metrics::record_source_op(self.main.name(), "get", "error");
                warn!(source = %self.main.name(), error = %e, "Blob get failed on main");
                first_error = Some(e);
            }
        }

        if !self.shadows.is_empty() {
            self.states.update(key, |s| s.downloading = true);
        }
        let mut found = None;
        for shadow in &self.shadows {
            match shadow.get(key).await {
                Ok(Some(record)) => {
                    crate::metrics::record_source_op(shadow.name(), "get", "success");
                    found = Some((shadow.name(), record));
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    crate::metrics::record_source_op(shadow.name(), "get", "error");
                    warn!(source = %shadow.name(), error = %e, "Blob get failed on shadow");
                    first_error.get_or_insert(e);
                }
            }
        }
        if !self.shadows.is_empty() {
            self.states.update(key, |s| s.downloading = false);
        }

        match found {
            Some((from, record)) => {
                self.cache_into_main(from, &record).await;
                Ok(Some(record))
            }
            None => first_error.map_or(Ok(None), |e| Err(e.into())),
        }
    }

    async fn cache_into_main(&self, from: &str, record: &BlobRecord) {
        if self.main.readonly() {
            return;
        }
        if !record.fits(self.main.max_blob_size()) {
            crate::metrics::record_blob_over_size(self.main.name());
            self.states.update(&record.key, |s| s.over_size = true);
            return;
        }
        match self.main.set(record.clone()).await {
            Ok(_) => {
                crate::metrics::record_blob_transfer(from, self.main.name(), record.size());
                self.states.update(&record.key, |s| s.need_download = false);
            }
            Err(e) => {
                warn!(key = %record.key, error = %e, "Failed to cache blob into main");
                self.states.update(&record.key, |s| s.need_download = true);
            }
        }
    }

    /// Write to main. Shadows catch up on the next `sync()`.
    ///
    /// A record larger than main accepts is not written: its state is marked
    /// `over_size` and the key is still returned.
    #[tracing::instrument(skip(self, record), fields(key = %record.key, size = record.size()))]
    pub async fn set(&self, record: BlobRecord) -> Result<String, SyncError> {
        if self.main.readonly() {
            return Err(SourceError::ReadOnly(self.main.name().to_string()).into());
        }

        let key = record.key.clone();
        if !record.fits(self.main.max_blob_size()) {
            warn!(limit = ?self.main.max_blob_size(), "Blob exceeds main source limit, not persisted");
            crate::metrics::record_blob_over_size(self.main.name());
            self.states.update(&key, |s| s.over_size = true);
            return Ok(key);
        }

        let key = match self.main.set(record).await {
            Ok(key) => key,
            Err(e) => {
                crate::metrics::record_source_op(self.main.name(), "set", "error");
                let message = e.to_string();
                self.states.update(&key, |s| s.error_message = Some(message));
                return Err(e.into());
            }
        };
        crate::metrics::record_source_op(self.main.name(), "set", "success");

        let pending = self.shadows.iter().any(|s| !s.readonly());
        self.states.update(&key, |s| {
            s.need_upload = pending;
            s.need_download = false;
            s.over_size = false;
            s.error_message = None;
        });
        Ok(key)
    }

    /// Delete from main and every writable shadow.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), SyncError> {
        let mut first_error: Option<SourceError> = None;
        for source in self.sources().filter(|s| !s.readonly()) {
            if let Err(e) = source.delete(key).await {
                crate::metrics::record_source_op(source.name(), "delete", "error");
                warn!(source = %source.name(), error = %e, "Blob delete failed");
                first_error.get_or_insert(e);
            }
        }
        self.states.update(key, |s| *s = BlobState::default());
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Union of keys across every source, sorted.
    ///
    /// Main must answer; unreachable shadows are skipped.
    pub async fn list(&self) -> Result<Vec<String>, SyncError> {
        let mut keys: BTreeSet<String> = self.main.list().await?.into_iter().collect();
        for shadow in &self.shadows {
            match shadow.list().await {
                Ok(found) => keys.extend(found),
                Err(e) => warn!(source = %shadow.name(), error = %e, "Blob list failed on shadow"),
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Push `key` to every writable shadow now, instead of waiting for `sync()`.
    ///
    /// Returns whether every target accepted it. A source with its own
    /// upload step (see [`BlobSource::upload`]) gets the final say.
    #[tracing::instrument(skip(self))]
    pub async fn upload(&self, key: &str) -> Result<bool, SyncError> {
        let Some(record) = self.get(key).await? else {
            debug!("Nothing to upload");
            return Ok(false);
        };

        self.states.update(key, |s| {
            s.uploading = true;
            s.error_message = None;
        });
        let result = self.upload_record(&record).await;
        self.states.update(key, |s| {
            s.uploading = false;
            match &result {
                Ok(true) => {
                    s.need_upload = false;
                    s.over_size = false;
                }
                Ok(false) => {}
                Err(e) => s.error_message = Some(e.to_string()),
            }
        });
        result
    }

    async fn upload_record(&self, record: &BlobRecord) -> Result<bool, SyncError> {
        let mut accepted = true;

        for shadow in self.shadows.iter().filter(|s| !s.readonly()) {
            if !record.fits(shadow.max_blob_size()) {
                crate::metrics::record_blob_over_size(shadow.name());
                self.states.update(&record.key, |s| s.over_size = true);
                accepted = false;
                continue;
            }
            if shadow.has(&record.key).await? {
                continue;
            }
            match shadow.set(record.clone()).await {
                Ok(_) => crate::metrics::record_blob_transfer(self.main.name(), shadow.name(), record.size()),
                Err(SourceError::Capacity { .. }) => {
                    crate::metrics::record_blob_over_size(shadow.name());
                    self.states.update(&record.key, |s| s.over_size = true);
                    accepted = false;
                }
                Err(e) => return Err(e.into()),
            }
        }

        for source in self.sources() {
            if let Some(ok) = source.upload(&record.key).await? {
                crate::metrics::record_source_op(source.name(), "upload", if ok { "success" } else { "rejected" });
                accepted &= ok;
            }
        }
        Ok(accepted)
    }

    /// Live state of `key`, combining engine flags with any source-reported state.
    pub fn blob_state(&self, key: &str) -> watch::Receiver<BlobState> {
        let (rx, idle) = self.states.subscribe(key);
        if let Some(tx) = idle {
            self.watch_sources(key, tx);
        }
        rx
    }

    /// Current state of `key` without subscribing.
    #[must_use]
    pub fn current_state(&self, key: &str) -> BlobState {
        self.states.current(key)
    }

    /// Forward source-reported state for `key` until its last receiver is dropped.
    fn watch_sources(&self, key: &str, tx: Arc<watch::Sender<BlobState>>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let watching = self.watchers.child_token();

        for source in self.sources() {
            let Some(mut source_rx) = source.blob_state(key) else {
                continue;
            };
            let states = self.states.clone();
            let cancel = watching.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        changed = source_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            states.republish(&key);
                        }
                    }
                }
            });
        }

        let states = self.states.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = watching.cancelled() => {}
                _ = tx.closed() => {
                    watching.cancel();
                    states.release(&key);
                }
            }
        });
    }

    /// Recompute `need_upload`/`need_download` for `key` from source presence.
    pub async fn refresh_state(&self, key: &str) -> Result<BlobState, SyncError> {
        let on_main = self.main.has(key).await?;
        let mut on_shadow = false;
        let mut missing_on_shadow = false;
        for shadow in &self.shadows {
            if shadow.has(key).await? {
                on_shadow = true;
            } else if !shadow.readonly() {
                missing_on_shadow = true;
            }
        }

        let main_writable = !self.main.readonly();
        self.states.update(key, |s| {
            s.need_upload = on_main && missing_on_shadow && !s.over_size;
            s.need_download = !on_main && on_shadow && main_writable;
        });
        Ok(self.states.current(key))
    }

    /// One reconciliation pass: copy every key to every writable source
    /// missing it, skipping targets it does not fit in.
    ///
    /// Keys matching the priority rule go first. Fails only when main
    /// cannot be listed; per-key failures are counted in the report.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> Result<BlobSyncReport, SyncError> {
        let started = Instant::now();
        let sources: Vec<&Arc<dyn BlobSource>> = self.sources().collect();
        let mut report = BlobSyncReport::default();

        let mut listings: Vec<Option<HashSet<String>>> = Vec::with_capacity(sources.len());
        for (i, source) in sources.iter().enumerate() {
            match source.list().await {
                Ok(keys) => listings.push(Some(keys.into_iter().collect())),
                Err(e) if i == 0 => {
                    crate::metrics::record_source_op(source.name(), "list", "error");
                    return Err(e.into());
                }
                Err(e) => {
                    crate::metrics::record_source_op(source.name(), "list", "error");
                    warn!(source = %source.name(), error = %e, "Blob list failed, skipping source this pass");
                    report.failed += 1;
                    listings.push(None);
                }
            }
        }

        let mut keys: Vec<String> = listings
            .iter()
            .flatten()
            .flat_map(|keys| keys.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        keys.sort_by_key(|key| !self.priority.matches(key));
        report.keys = keys.len();

        for key in &keys {
            self.reconcile(key, &sources, &listings, &mut report).await;
        }

        crate::metrics::record_blob_sync_pass(started.elapsed(), report.copied, report.failed);
        info!(
            keys = report.keys,
            copied = report.copied,
            over_size = report.over_size,
            failed = report.failed,
            "Blob sync pass complete"
        );
        Ok(report)
    }

    async fn reconcile(
        &self,
        key: &str,
        sources: &[&Arc<dyn BlobSource>],
        listings: &[Option<HashSet<String>>],
        report: &mut BlobSyncReport,
    ) {
        let holders: Vec<usize> = (0..sources.len())
            .filter(|&i| listings[i].as_ref().is_some_and(|keys| keys.contains(key)))
            .collect();
        let targets: Vec<usize> = (0..sources.len())
            .filter(|&i| {
                listings[i].as_ref().is_some_and(|keys| !keys.contains(key)) && !sources[i].readonly()
            })
            .collect();

        // Writable sources whose listing failed: they may or may not hold the key.
        let unknown: Vec<usize> = (0..sources.len())
            .filter(|&i| listings[i].is_none() && !sources[i].readonly())
            .collect();
        let unknown_main = unknown.contains(&0);
        let unknown_shadow = unknown.iter().any(|&i| i != 0);

        if targets.is_empty() {
            self.states.update(key, |s| {
                s.need_upload = unknown_shadow;
                s.need_download = unknown_main;
                if unknown.is_empty() {
                    s.over_size = false;
                    s.error_message = None;
                }
            });
            return;
        }

        let mut fetched = None;
        for &i in &holders {
            match sources[i].get(key).await {
                Ok(Some(record)) => {
                    fetched = Some((i, record));
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(source = %sources[i].name(), key, error = %e, "Blob fetch failed"),
            }
        }
        let Some((from, record)) = fetched else {
            report.failed += 1;
            self.states.update(key, |s| {
                s.need_upload = unknown_shadow || targets.iter().any(|&i| i != 0);
                s.need_download = unknown_main || targets.contains(&0);
            });
            return;
        };

        self.states.update(key, |s| {
            s.downloading = targets.contains(&0);
            s.uploading = targets.iter().any(|&i| i != 0);
        });

        let mut over_size = false;
        let mut missing_main = false;
        let mut missing_shadow = false;
        let mut error = None;

        for &i in &targets {
            let target = sources[i];
            if !record.fits(target.max_blob_size()) {
                debug!(key, target = %target.name(), size = record.size(), "Skipping over-size blob");
                crate::metrics::record_blob_over_size(target.name());
                report.over_size += 1;
                over_size = true;
                continue;
            }
            match target.set(record.clone()).await {
                Ok(_) => {
                    crate::metrics::record_blob_transfer(sources[from].name(), target.name(), record.size());
                    report.copied += 1;
                }
                Err(SourceError::Capacity { .. }) => {
                    crate::metrics::record_blob_over_size(target.name());
                    report.over_size += 1;
                    over_size = true;
                }
                Err(e) => {
                    warn!(key, target = %target.name(), error = %e, "Blob copy failed");
                    report.failed += 1;
                    if i == 0 {
                        missing_main = true;
                    } else {
                        missing_shadow = true;
                    }
                    error = Some(e.to_string());
                }
            }
        }

        self.states.update(key, |s| {
            s.uploading = false;
            s.downloading = false;
            // Sources listed this pass decide afresh; unlisted ones keep their last verdict.
            s.over_size = over_size || (s.over_size && !unknown.is_empty());
            s.need_upload = missing_shadow || unknown_shadow;
            s.need_download = missing_main || unknown_main;
            s.error_message = error;
        });
    }

    /// Start the background reconciliation loop.
    ///
    /// Runs a pass immediately, then every `blob_sync_interval_secs`; after a
    /// failed pass it backs off instead. Without an interval it stops after
    /// the first successful pass.
    #[tracing::instrument(skip(self))]
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run(
            Arc::downgrade(self),
            cancel.clone(),
            self.interval,
            self.retry.clone(),
        ));
        *task = Some(LoopTask { cancel, handle });
        info!(interval = ?self.interval, "Blob engine started");
    }

    async fn run(
        engine: Weak<Self>,
        cancel: CancellationToken,
        interval: Option<Duration>,
        retry: RetryConfig,
    ) {
        let mut backoff = retry.backoff();
        loop {
            let Some(this) = engine.upgrade() else {
                return;
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = this.sync() => result,
            };
            drop(this);

            let delay = match result {
                Ok(_) => {
                    backoff = retry.backoff();
                    match interval {
                        Some(interval) => interval,
                        None => return,
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "Blob sync pass failed, backing off");
                    delay
                }
            };
            if !sleep_or_cancel(delay, &cancel).await {
                return;
            }
        }
    }

    /// Stop the background loop and wait for it.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Blob sync loop ended abnormally");
            }
            info!("Blob engine stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    /// Let `key` go first in every sync pass.
    pub fn set_priority_key(&self, key: impl Into<String>) {
        let key = key.into();
        self.priority.set_rule(move |id| id == key);
    }

    pub fn clear_priority(&self) {
        self.priority.clear_rule();
    }

    #[must_use]
    pub fn priority_target(&self) -> &SharedPriorityTarget {
        &self.priority
    }
}

impl Drop for BlobEngine {
    fn drop(&mut self) {
        self.watchers.cancel();
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}
