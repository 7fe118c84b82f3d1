//! Property-based tests (fuzzing) for the queues and the reference CRDT.
//!
//! Uses proptest to generate random inputs and verify the invariants the
//! sync loop relies on: queues never duplicate or drop items, priority
//! dequeues are correct, and replicas converge whatever the delivery order.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use doc_sync_engine::{
    AsyncQueue, BackpressureLevel, CrdtDoc, OpLogDoc, PendingUpdate, PriorityAsyncQueue, SharedPriorityTarget,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Updates from three authors, each a list of inserted texts.
fn authored_updates_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec("[a-z]{1,8}", 0..6), 3).prop_map(|authors| {
        let mut updates = Vec::new();
        for (i, texts) in authors.into_iter().enumerate() {
            let mut doc = OpLogDoc::with_client(i as u64 + 1);
            for text in texts {
                updates.push(doc.insert(text));
            }
        }
        updates
    })
}

fn apply_all(client: u64, updates: &[Vec<u8>]) -> OpLogDoc {
    let mut doc = OpLogDoc::with_client(client);
    for update in updates {
        doc.apply_update(update).expect("well-formed update");
    }
    doc
}

// =============================================================================
// Queue properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Dequeuing M times from N items yields min(N, M) distinct items in FIFO order.
    #[test]
    fn prop_queue_dequeues_without_duplicates(n in 0usize..50, m in 0usize..60) {
        let rt = runtime();
        let queue = AsyncQueue::new();
        queue.push(0..n);
        let cancel = CancellationToken::new();

        let taken = rt.block_on(async {
            let mut taken = Vec::new();
            for _ in 0..m.min(n) {
                taken.push(queue.next(&cancel).await.unwrap());
            }
            taken
        });

        prop_assert_eq!(taken.len(), m.min(n));
        prop_assert_eq!(taken.iter().collect::<HashSet<_>>().len(), taken.len());
        prop_assert_eq!(taken, (0..m.min(n)).collect::<Vec<_>>());
        prop_assert_eq!(queue.len(), n - m.min(n));
    }

    /// N concurrent waiters and M pushed items: exactly min(N, M) waiters resolve, each with its own item.
    #[test]
    fn prop_concurrent_waiters_resolve_once_each(n in 1usize..12, m in 0usize..12) {
        let rt = runtime();
        let (resolved, remaining) = rt.block_on(async {
            let queue = Arc::new(AsyncQueue::new());
            let cancel = CancellationToken::new();
            let waiters: Vec<_> = (0..n)
                .map(|_| {
                    let queue = queue.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move { queue.next(&cancel).await.ok() })
                })
                .collect();
            tokio::task::yield_now().await;

            queue.push(0..m);
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();

            let mut resolved = Vec::new();
            for waiter in waiters {
                if let Some(item) = waiter.await.unwrap() {
                    resolved.push(item);
                }
            }
            (resolved, queue.len())
        });

        prop_assert_eq!(resolved.len(), n.min(m));
        prop_assert_eq!(resolved.iter().collect::<HashSet<_>>().len(), resolved.len());
        prop_assert_eq!(remaining, m - n.min(m));
    }

    /// Every priority match is served before anything else, each group in FIFO order.
    #[test]
    fn prop_priority_matches_come_first(
        docs in prop::collection::vec(0u8..6, 0..40),
        hot in 0u8..6,
    ) {
        let rt = runtime();
        let target = SharedPriorityTarget::new();
        let hot_id = format!("doc-{hot}");
        let rule_id = hot_id.clone();
        target.set_rule(move |id| id == rule_id);

        let queue = PriorityAsyncQueue::new(target);
        let updates: Vec<PendingUpdate> = docs
            .iter()
            .enumerate()
            .map(|(i, d)| PendingUpdate::new(format!("doc-{d}"), vec![i as u8]))
            .collect();
        queue.push(updates.clone());
        let cancel = CancellationToken::new();

        let served = rt.block_on(async {
            let mut served = Vec::new();
            while !queue.is_empty() {
                served.push(queue.next(&cancel).await.unwrap());
            }
            served
        });

        let (mut expected, rest): (Vec<_>, Vec<_>) = updates.into_iter().partition(|u| u.id == hot_id);
        expected.extend(rest);
        prop_assert_eq!(served, expected);
    }

    #[test]
    fn prop_backpressure_monotonic_in_depth(a in 0usize..5000, b in 0usize..5000, warn in 1usize..2000) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(BackpressureLevel::from_depth(lo, warn) <= BackpressureLevel::from_depth(hi, warn));
    }
}

// =============================================================================
// CRDT properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replicas receiving the same updates in any order converge.
    #[test]
    fn prop_replicas_converge_under_any_order(
        (updates, shuffled) in authored_updates_strategy()
            .prop_flat_map(|updates| (Just(updates.clone()), Just(updates).prop_shuffle()))
    ) {
        let in_order = apply_all(100, &updates);
        let reordered = apply_all(200, &shuffled);

        prop_assert_eq!(in_order.state_vector(), reordered.state_vector());
        prop_assert_eq!(in_order.texts(), reordered.texts());
    }

    /// Applying an update a second time changes nothing.
    #[test]
    fn prop_apply_is_idempotent(updates in authored_updates_strategy()) {
        let once = apply_all(100, &updates);
        let mut twice = apply_all(100, &updates);
        for update in &updates {
            twice.apply_update(update).unwrap();
        }
        prop_assert_eq!(once.state_vector(), twice.state_vector());
        prop_assert_eq!(once.len(), twice.len());
    }

    /// A merged update carries exactly what its parts do.
    #[test]
    fn prop_merge_updates_matches_sequential_apply(updates in authored_updates_strategy()) {
        let merged = OpLogDoc::merge_updates(&updates).unwrap();
        let via_merge = apply_all(100, std::slice::from_ref(&merged));
        let sequential = apply_all(100, &updates);
        prop_assert_eq!(via_merge.texts(), sequential.texts());
        prop_assert_eq!(via_merge.state_vector(), sequential.state_vector());
    }

    /// A diff against a peer's state vector brings the peer level.
    #[test]
    fn prop_diff_since_closes_the_gap(
        updates in authored_updates_strategy(),
        split in any::<prop::sample::Index>(),
    ) {
        let full = apply_all(100, &updates);
        let cut = if updates.is_empty() { 0 } else { split.index(updates.len() + 1) };
        let mut partial = apply_all(200, &updates[..cut]);

        let diff = full.diff_since(Some(&partial.state_vector())).unwrap();
        partial.apply_update(&diff).unwrap();
        prop_assert_eq!(partial.state_vector(), full.state_vector());
        prop_assert!(full.diff_since(Some(&partial.state_vector())).unwrap().is_empty());
    }

    /// Garbage never panics the decoder.
    #[test]
    fn fuzz_apply_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut doc = OpLogDoc::with_client(1);
        let before = doc.state_vector();
        if doc.apply_update(&bytes).is_err() {
            prop_assert_eq!(doc.state_vector(), before);
        }
    }
}
