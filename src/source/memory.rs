// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory sources.
//!
//! Useful for:
//! - Tests (no external dependencies)
//! - A "server" shared by several engines in one process
//! - Same-process tabs exchanging presence through [`MemoryAwarenessHub`]
//!
//! Every source can be switched offline, after which all calls fail with a
//! transient [`SourceError::Transport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{
    AwarenessSource, BlobSource, DocSource, PulledDoc, RemoteUpdate, RemoteUpdates, SourceError,
};
use crate::awareness::AwarenessUpdate;
use crate::blob::BlobRecord;
use crate::doc::{CrdtDoc, CrdtError, DocId, OpLogDoc};

fn crdt_to_source(e: CrdtError) -> SourceError {
    SourceError::VersionMismatch(e.to_string())
}

/// A document store that notifies every subscriber of every accepted push.
pub struct MemoryDocSource<D> {
    name: String,
    docs: Mutex<HashMap<DocId, D>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RemoteUpdate>>>,
    offline: AtomicBool,
}

impl<D: CrdtDoc> MemoryDocSource<D> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), SourceError> {
        if self.is_offline() {
            return Err(SourceError::Transport(format!("{} is offline", self.name)));
        }
        Ok(())
    }

    /// Simulate a write made by some other client: apply and notify subscribers.
    pub fn push_remote(&self, doc_id: &str, update: &[u8]) {
        if self.apply(doc_id, update).is_ok() {
            self.notify(doc_id, update);
        }
    }

    fn apply(&self, doc_id: &str, update: &[u8]) -> Result<(), SourceError> {
        if update.is_empty() {
            return Ok(());
        }
        self.docs
            .lock()
            .entry(doc_id.to_string())
            .or_default()
            .apply_update(update)
            .map_err(crdt_to_source)
    }

    fn notify(&self, doc_id: &str, data: &[u8]) {
        let update = RemoteUpdate {
            doc_id: doc_id.to_string(),
            data: data.to_vec(),
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    #[must_use]
    pub fn contains(&self, doc_id: &str) -> bool {
        self.docs.lock().contains_key(doc_id)
    }

    #[must_use]
    pub fn state_vector(&self, doc_id: &str) -> Option<Vec<u8>> {
        self.docs.lock().get(doc_id).map(|doc| doc.state_vector())
    }

    pub fn read<R, F>(&self, doc_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&D) -> R,
    {
        self.docs.lock().get(doc_id).map(f)
    }

    /// Open notification channels. Closed ones are pruned on the next push.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Close every notification channel, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.subscribers.lock().clear();
    }
}

impl MemoryDocSource<OpLogDoc> {
    /// Inserted texts of `doc_id`, empty when absent.
    #[must_use]
    pub fn texts(&self, doc_id: &str) -> Vec<String> {
        self.read(doc_id, OpLogDoc::texts).unwrap_or_default()
    }
}

#[async_trait]
impl<D: CrdtDoc> DocSource for MemoryDocSource<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, doc_id: &str, state_vector: &[u8]) -> Result<Option<PulledDoc>, SourceError> {
        self.check_online()?;
        let docs = self.docs.lock();
        let Some(doc) = docs.get(doc_id) else {
            return Ok(None);
        };
        Ok(Some(PulledDoc {
            data: doc.diff_since(Some(state_vector)).map_err(crdt_to_source)?,
            state: doc.state_vector(),
        }))
    }

    async fn push(&self, doc_id: &str, data: &[u8]) -> Result<(), SourceError> {
        self.check_online()?;
        self.apply(doc_id, data)?;
        self.notify(doc_id, data);
        Ok(())
    }

    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

/// A blob store backed by a `DashMap`.
pub struct MemoryBlobSource {
    name: String,
    blobs: DashMap<String, BlobRecord>,
    readonly: bool,
    max_blob_size: Mutex<Option<usize>>,
    offline: AtomicBool,
}

impl MemoryBlobSource {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blobs: DashMap::new(),
            readonly: false,
            max_blob_size: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    #[must_use]
    pub fn with_max_blob_size(mut self, limit: usize) -> Self {
        *self.max_blob_size.get_mut() = Some(limit);
        self
    }

    /// Change the quota of a live source, e.g. after a plan upgrade.
    pub fn set_max_blob_size(&self, limit: Option<usize>) {
        *self.max_blob_size.lock() = limit;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), SourceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SourceError::Transport(format!("{} is offline", self.name)));
        }
        Ok(())
    }

    /// Seed a record directly, bypassing readonly and size checks.
    pub fn insert(&self, record: BlobRecord) {
        self.blobs.insert(record.key.clone(), record);
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobSource for MemoryBlobSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn max_blob_size(&self) -> Option<usize> {
        *self.max_blob_size.lock()
    }

    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, SourceError> {
        self.check_online()?;
        Ok(self.blobs.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, blob: BlobRecord) -> Result<String, SourceError> {
        self.check_online()?;
        if self.readonly {
            return Err(SourceError::ReadOnly(self.name.clone()));
        }
        if let Some(limit) = self.max_blob_size() {
            let size = blob.size();
            if size > limit {
                return Err(SourceError::Capacity {
                    key: blob.key,
                    size,
                    limit,
                });
            }
        }
        let key = blob.key.clone();
        self.blobs.insert(key.clone(), blob);
        Ok(key)
    }

    async fn delete(&self, key: &str) -> Result<(), SourceError> {
        self.check_online()?;
        if self.readonly {
            return Err(SourceError::ReadOnly(self.name.clone()));
        }
        self.blobs.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, SourceError> {
        self.check_online()?;
        let mut keys: Vec<String> = self.blobs.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        self.check_online()?;
        Ok(self.blobs.contains_key(key))
    }
}

type Member = (u64, mpsc::UnboundedSender<AwarenessUpdate>);

/// Relays awareness updates between every source created from it,
/// like a broadcast channel between browser tabs.
#[derive(Clone, Default)]
pub struct MemoryAwarenessHub {
    members: Arc<Mutex<Vec<Member>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryAwarenessHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new participant. It never receives its own broadcasts.
    #[must_use]
    pub fn source(&self, name: impl Into<String>) -> MemoryAwarenessSource {
        MemoryAwarenessSource {
            name: name.into(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            hub: self.clone(),
        }
    }

    /// Live subscriptions across all participants.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut members = self.members.lock();
        members.retain(|(_, tx)| !tx.is_closed());
        members.len()
    }
}

pub struct MemoryAwarenessSource {
    name: String,
    id: u64,
    hub: MemoryAwarenessHub,
}

#[async_trait]
impl AwarenessSource for MemoryAwarenessSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn broadcast(&self, update: &AwarenessUpdate) -> Result<(), SourceError> {
        self.hub.members.lock().retain(|(id, tx)| {
            *id == self.id || tx.send(update.clone()).is_ok()
        });
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AwarenessUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.members.lock().push((self.id, tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_unknown_doc_is_none() {
        let source: MemoryDocSource<OpLogDoc> = MemoryDocSource::new("mem");
        let sv = OpLogDoc::default().state_vector();
        assert_eq!(source.pull("nope", &sv).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_then_pull_returns_missing_ops() {
        let source: MemoryDocSource<OpLogDoc> = MemoryDocSource::new("mem");
        let mut writer = OpLogDoc::with_client(1);
        source.push("doc", &writer.insert("a")).await.unwrap();

        let reader = OpLogDoc::with_client(2);
        let pulled = source.pull("doc", &reader.state_vector()).await.unwrap().unwrap();
        assert!(!pulled.data.is_empty());
        assert_eq!(source.texts("doc"), vec!["a".to_string()]);

        let caught_up = source.pull("doc", &pulled.state).await.unwrap().unwrap();
        assert!(caught_up.data.is_empty());
    }

    #[tokio::test]
    async fn test_push_notifies_subscribers() {
        let source: MemoryDocSource<OpLogDoc> = MemoryDocSource::new("mem");
        let mut rx = source.subscribe().await.unwrap();
        let mut writer = OpLogDoc::with_client(1);
        let update = writer.insert("x");
        source.push("doc", &update).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.doc_id, "doc");
        assert_eq!(got.data, update);
    }

    #[tokio::test]
    async fn test_offline_fails_transiently() {
        let source: MemoryDocSource<OpLogDoc> = MemoryDocSource::new("mem");
        source.set_offline(true);
        let err = source.push("doc", b"{}").await.unwrap_err();
        assert!(err.is_transient());
        source.set_offline(false);
        assert!(source.subscribe().await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_update_is_version_mismatch() {
        let source: MemoryDocSource<OpLogDoc> = MemoryDocSource::new("mem");
        let err = source.push("doc", br#"{"v":9,"ops":[]}"#).await.unwrap_err();
        assert!(matches!(err, SourceError::VersionMismatch(_)));
    }

    #[tokio::test]
    async fn test_blob_capacity_and_readonly() {
        let small = MemoryBlobSource::new("small").with_max_blob_size(3);
        let err = small
            .set(BlobRecord::new("k", vec![0; 4], "a/b"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Capacity { size: 4, limit: 3, .. }));
        small.set_max_blob_size(Some(8));
        assert_eq!(small.set(BlobRecord::new("k", vec![0; 4], "a/b")).await.unwrap(), "k");

        let cdn = MemoryBlobSource::new("cdn").readonly();
        let err = cdn.set(BlobRecord::new("k", vec![0], "a/b")).await.unwrap_err();
        assert_eq!(err, SourceError::ReadOnly("cdn".into()));
    }

    #[tokio::test]
    async fn test_hub_skips_sender() {
        let hub = MemoryAwarenessHub::new();
        let a = hub.source("a");
        let b = hub.source("b");
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        let update = AwarenessUpdate {
            client_id: 1,
            clock: 1,
            state: Some(serde_json::json!({"cursor": 3})),
        };
        a.broadcast(&update).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), update);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count(), 2);
    }
}
