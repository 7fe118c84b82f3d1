// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-steered queue.
//!
//! A [`SharedPriorityTarget`] is created once per engine and handed to every
//! peer queue it owns. Setting its rule (typically "the document on screen")
//! lets every queue serve matching items first without the queues knowing
//! about each other.
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::{PriorityAsyncQueue, SharedPriorityTarget, Identified};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, PartialEq)]
//! struct Job(&'static str);
//! impl Identified for Job {
//!     fn id(&self) -> &str { self.0 }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let target = SharedPriorityTarget::new();
//! let queue = PriorityAsyncQueue::new(target.clone());
//! queue.push([Job("a"), Job("b"), Job("visible")]);
//!
//! target.set_rule(|id| id == "visible");
//! let cancel = CancellationToken::new();
//! assert_eq!(queue.next(&cancel).await.unwrap(), Job("visible"));
//! assert_eq!(queue.next(&cancel).await.unwrap(), Job("a"));
//! # }
//! ```

use std::sync::Arc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::async_queue::AsyncQueue;
use crate::error::SyncError;

/// Items that can be matched against a priority rule.
pub trait Identified {
    fn id(&self) -> &str;
}

type PriorityRule = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Mutable priority rule shared by reference across queues.
#[derive(Clone, Default)]
pub struct SharedPriorityTarget {
    rule: Arc<RwLock<Option<PriorityRule>>>,
}

impl SharedPriorityTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rule<F>(&self, rule: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.rule.write() = Some(Arc::new(rule));
    }

    pub fn clear_rule(&self) {
        *self.rule.write() = None;
    }

    /// Whether `id` currently has priority. False when no rule is set.
    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        let rule = self.rule.read().clone();
        rule.is_some_and(|rule| rule(id))
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.rule.read().is_some()
    }
}

impl std::fmt::Debug for SharedPriorityTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPriorityTarget")
            .field("is_set", &self.is_set())
            .finish()
    }
}

/// [`AsyncQueue`] whose `next` serves the first priority match, else FIFO head.
pub struct PriorityAsyncQueue<T> {
    inner: AsyncQueue<T>,
    target: SharedPriorityTarget,
}

impl<T: Identified> PriorityAsyncQueue<T> {
    #[must_use]
    pub fn new(target: SharedPriorityTarget) -> Self {
        Self {
            inner: AsyncQueue::new(),
            target,
        }
    }

    pub fn push<I: IntoIterator<Item = T>>(&self, items: I) {
        self.inner.push(items);
    }

    pub fn push_front(&self, item: T) {
        self.inner.push_front(item);
    }

    pub async fn next(&self, cancel: &CancellationToken) -> Result<T, SyncError> {
        let target = &self.target;
        self.inner
            .next_with(cancel, |buffer| {
                if !target.is_set() {
                    return Some(0);
                }
                buffer.iter().position(|item| target.matches(item.id())).or(Some(0))
            })
            .await
    }

    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
        T: Clone,
    {
        self.inner.find(predicate)
    }

    pub fn remove<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.inner.remove(predicate)
    }

    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.snapshot()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn target(&self) -> &SharedPriorityTarget {
        &self.target
    }
}
