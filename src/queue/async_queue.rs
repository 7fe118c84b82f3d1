// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cancellable async producer/consumer queue.
//!
//! Producers [`push`](AsyncQueue::push) synchronously; consumers await
//! [`next`](AsyncQueue::next) with a cancellation token. Every push hands out
//! exactly one wake-up, so N waiters and M items resolve exactly `min(N, M)`
//! waiters, each with a distinct item.
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::AsyncQueue;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let queue = AsyncQueue::new();
//! queue.push(["a", "b"]);
//!
//! let cancel = CancellationToken::new();
//! assert_eq!(queue.next(&cancel).await.unwrap(), "a");
//! assert_eq!(queue.len(), 1);
//! # }
//! ```

use std::collections::VecDeque;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

pub struct AsyncQueue<T> {
    buffer: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> AsyncQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append items and wake one waiter per item.
    pub fn push<I: IntoIterator<Item = T>>(&self, items: I) {
        let added = {
            let mut buffer = self.buffer.lock();
            let before = buffer.len();
            buffer.extend(items);
            buffer.len() - before
        };
        for _ in 0..added {
            self.notify.notify_one();
        }
    }

    /// Put an item back at the head, ahead of everything else.
    pub fn push_front(&self, item: T) {
        self.buffer.lock().push_front(item);
        self.notify.notify_one();
    }

    /// Wait for the head item.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<T, SyncError> {
        self.next_with(cancel, |_| Some(0)).await
    }

    /// Wait for an item, letting `select` pick its index in the buffer.
    ///
    /// `select` only runs against a non-empty buffer and must return an index
    /// inside it. Removal happens under the buffer lock in the same poll that
    /// returns, so cancellation can never lose an item.
    pub async fn next_with<F>(&self, cancel: &CancellationToken, select: F) -> Result<T, SyncError>
    where
        F: Fn(&VecDeque<T>) -> Option<usize>,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.take(&select) {
                return Ok(item);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // A wake-up may have been meant for us; hand it on.
                    if !self.is_empty() {
                        self.notify.notify_one();
                    }
                    return Err(SyncError::Cancelled);
                }
                _ = &mut notified => {}
            }
        }
    }

    fn take<F>(&self, select: &F) -> Option<T>
    where
        F: Fn(&VecDeque<T>) -> Option<usize>,
    {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return None;
        }
        let index = select(&buffer).filter(|i| *i < buffer.len()).unwrap_or(0);
        buffer.remove(index)
    }

    /// Non-consuming lookup.
    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
        T: Clone,
    {
        self.buffer.lock().iter().find(|item| predicate(item)).cloned()
    }

    /// Copy of the buffer, head first.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Remove every buffered item matching `predicate`, in queue order.
    pub fn remove<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut buffer = self.buffer.lock();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(buffer.len());
        for item in buffer.drain(..) {
            if predicate(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        *buffer = kept;
        removed
    }

    /// Drop all buffered items. Pending waiters keep waiting.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
