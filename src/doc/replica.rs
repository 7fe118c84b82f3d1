//! The local replica.

use std::collections::HashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::crdt::{CrdtDoc, CrdtError};
use super::{DocChange, DocId, UpdateOrigin};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Root document plus every sub-document loaded so far.
///
/// Always accepts writes, whatever the state of any source.
pub struct SyncedDocument<D> {
    root_id: DocId,
    docs: Mutex<HashMap<DocId, D>>,
    changes: broadcast::Sender<DocChange>,
}

impl<D: CrdtDoc> SyncedDocument<D> {
    #[must_use]
    pub fn new(root_id: impl Into<DocId>) -> Self {
        Self::with_root(root_id, D::default())
    }

    /// Start from an existing root document (e.g. one the editor built).
    #[must_use]
    pub fn with_root(root_id: impl Into<DocId>, root: D) -> Self {
        let root_id = root_id.into();
        let mut docs = HashMap::new();
        docs.insert(root_id.clone(), root);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            root_id,
            docs: Mutex::new(docs),
            changes,
        }
    }

    #[must_use]
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    #[must_use]
    pub fn contains(&self, doc_id: &str) -> bool {
        self.docs.lock().contains_key(doc_id)
    }

    #[must_use]
    pub fn doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self.docs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sub-documents referenced by the root.
    #[must_use]
    pub fn sub_doc_ids(&self) -> Vec<DocId> {
        self.docs
            .lock()
            .get(&self.root_id)
            .map(|root| root.sub_doc_ids())
            .unwrap_or_default()
    }

    /// State vector of `doc_id`; an absent document reports the empty state.
    #[must_use]
    pub fn state_vector(&self, doc_id: &str) -> Vec<u8> {
        match self.docs.lock().get(doc_id) {
            Some(doc) => doc.state_vector(),
            None => D::default().state_vector(),
        }
    }

    pub fn diff_since(&self, doc_id: &str, remote_state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError> {
        match self.docs.lock().get(doc_id) {
            Some(doc) => doc.diff_since(remote_state_vector),
            None => Ok(Vec::new()),
        }
    }

    /// Merge `update` into `doc_id`, creating the document if needed.
    ///
    /// Returns whether the replica changed. Re-applying a known update is a
    /// no-op and emits no change notification.
    pub fn apply(&self, doc_id: &str, update: &[u8], origin: UpdateOrigin) -> Result<bool, CrdtError> {
        if update.is_empty() {
            return Ok(false);
        }
        let changed = {
            let mut docs = self.docs.lock();
            let doc = docs.entry(doc_id.to_string()).or_default();
            let before = doc.state_vector();
            doc.apply_update(update)?;
            doc.state_vector() != before
        };
        if changed {
            debug!(doc_id, ?origin, bytes = update.len(), "Merged update into replica");
            self.notify(doc_id, origin);
        }
        Ok(changed)
    }

    /// Run a local edit and return its result plus the delta it produced.
    pub fn edit<R, F>(&self, doc_id: &str, f: F) -> Result<(R, Vec<u8>), CrdtError>
    where
        F: FnOnce(&mut D) -> R,
    {
        let (result, delta) = {
            let mut docs = self.docs.lock();
            let doc = docs.entry(doc_id.to_string()).or_default();
            let before = doc.state_vector();
            let result = f(doc);
            (result, doc.diff_since(Some(&before))?)
        };
        if !delta.is_empty() {
            self.notify(doc_id, UpdateOrigin::Local);
        }
        Ok((result, delta))
    }

    /// Read-only access. `None` when the document is not loaded.
    pub fn read<R, F>(&self, doc_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&D) -> R,
    {
        self.docs.lock().get(doc_id).map(f)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }

    fn notify(&self, doc_id: &str, origin: UpdateOrigin) {
        // No receivers is fine.
        let _ = self.changes.send(DocChange {
            doc_id: doc_id.to_string(),
            origin,
        });
    }
}
