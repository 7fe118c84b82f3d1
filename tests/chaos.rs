//! Chaos Testing for the Doc Sync Engine
//!
//! This module tests failure scenarios using:
//! 1. **Failing source wrappers** - precise error injection at specific call counts
//! 2. **Outages** - sources going away mid-sync and coming back
//! 3. **Dropped connections** - notification channels closing under a peer
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;

use doc_sync_engine::{
    BlobEngine, BlobRecord, BlobSource, DocEngine, DocSource, MemoryBlobSource, MemoryDocSource, OpLogDoc,
    PulledDoc, RemoteUpdates, SourceError, SyncEngineConfig, SyncStatus,
};

const ROOT: &str = "workspace";
const TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Failing Source Wrappers - Precise Error Injection
// =============================================================================

/// Counts calls and fails the chosen ones with a transport error.
struct FailurePlan {
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every call from this number on, until healed
    fail_from: Option<u64>,
    healed: AtomicBool,
}

impl FailurePlan {
    fn on_calls(fail_on_calls: Vec<u64>) -> Self {
        Self {
            call_count: AtomicU64::new(0),
            fail_on_calls,
            fail_from: None,
            healed: AtomicBool::new(false),
        }
    }

    fn after(n: u64) -> Self {
        Self {
            fail_from: Some(n + 1),
            ..Self::on_calls(Vec::new())
        }
    }

    fn maybe_fail(&self, what: &str) -> Result<(), SourceError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.healed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let fail = self.fail_on_calls.contains(&count) || self.fail_from.is_some_and(|from| count >= from);
        if fail {
            Err(SourceError::Transport(format!("injected failure on {what} (call {count})")))
        } else {
            Ok(())
        }
    }

    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }
}

struct FailingDocSource {
    inner: Arc<MemoryDocSource<OpLogDoc>>,
    plan: FailurePlan,
}

#[async_trait]
impl DocSource for FailingDocSource {
    fn name(&self) -> &str {
        DocSource::name(self.inner.as_ref())
    }

    async fn pull(&self, doc_id: &str, state_vector: &[u8]) -> Result<Option<PulledDoc>, SourceError> {
        self.plan.maybe_fail("pull")?;
        self.inner.pull(doc_id, state_vector).await
    }

    async fn push(&self, doc_id: &str, data: &[u8]) -> Result<(), SourceError> {
        self.plan.maybe_fail("push")?;
        self.inner.push(doc_id, data).await
    }

    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError> {
        self.plan.maybe_fail("subscribe")?;
        self.inner.subscribe().await
    }
}

struct FailingBlobSource {
    inner: MemoryBlobSource,
    plan: FailurePlan,
}

#[async_trait]
impl BlobSource for FailingBlobSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, SourceError> {
        self.plan.maybe_fail("get")?;
        self.inner.get(key).await
    }

    async fn set(&self, blob: BlobRecord) -> Result<String, SourceError> {
        self.plan.maybe_fail("set")?;
        self.inner.set(blob).await
    }

    async fn delete(&self, key: &str) -> Result<(), SourceError> {
        self.plan.maybe_fail("delete")?;
        self.inner.delete(key).await
    }

    async fn list(&self) -> Result<Vec<String>, SourceError> {
        self.plan.maybe_fail("list")?;
        self.inner.list().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn doc_engine(main: Arc<dyn DocSource>, shadow: Arc<dyn DocSource>) -> DocEngine<OpLogDoc> {
    DocEngine::new(ROOT, main, vec![shadow], &SyncEngineConfig::for_tests()).expect("distinct peers")
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Document peers under failure
// =============================================================================

#[tokio::test]
async fn test_chaos_intermittent_failures_lose_nothing() {
    let local = Arc::new(MemoryDocSource::<OpLogDoc>::new("local"));
    let cloud = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
    let flaky = Arc::new(FailingDocSource {
        inner: cloud.clone(),
        plan: FailurePlan::on_calls(vec![1, 2, 4, 5, 6, 9]),
    });
    let engine = doc_engine(local.clone(), flaky.clone());

    for i in 0..20 {
        engine.edit(ROOT, |doc| doc.insert(format!("edit {i}"))).unwrap();
    }
    engine.start();
    tokio::time::timeout(TIMEOUT, engine.wait_for_synced())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cloud.texts(ROOT).len(), 20);
    assert_eq!(local.texts(ROOT).len(), 20);
    assert!(flaky.plan.calls() > 6);
    engine.stop().await;
}

#[tokio::test]
async fn test_chaos_outage_keeps_edits_queued_until_recovery() {
    let local = Arc::new(MemoryDocSource::<OpLogDoc>::new("local"));
    let cloud = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
    let failing = Arc::new(FailingDocSource {
        inner: cloud.clone(),
        plan: FailurePlan::after(3),
    });
    let engine = doc_engine(local.clone(), failing.clone());
    engine.start();
    tokio::time::timeout(TIMEOUT, engine.wait_for_synced())
        .await
        .unwrap()
        .unwrap();

    // Every call from here on fails.
    for i in 0..5 {
        engine.edit(ROOT, |doc| doc.insert(format!("during outage {i}"))).unwrap();
    }
    eventually("cloud peer to back off", || engine.state().retrying).await;
    eventually("local to keep syncing", || local.texts(ROOT).len() == 5).await;
    assert_eq!(engine.status(), SyncStatus::Syncing);
    assert!(cloud.texts(ROOT).is_empty());

    failing.plan.heal();
    tokio::time::timeout(TIMEOUT, engine.wait_for_synced())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cloud.texts(ROOT).len(), 5);
    engine.stop().await;
}

#[tokio::test]
async fn test_chaos_stop_during_backoff_returns_update_to_queue() {
    let local = Arc::new(MemoryDocSource::<OpLogDoc>::new("local"));
    let cloud = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
    let engine = doc_engine(local.clone(), cloud.clone());
    engine.start();
    tokio::time::timeout(TIMEOUT, engine.wait_for_synced())
        .await
        .unwrap()
        .unwrap();

    cloud.set_offline(true);
    engine.edit(ROOT, |doc| doc.insert("stuck")).unwrap();
    eventually("cloud peer to back off", || engine.state().retrying).await;
    engine.stop().await;

    let pending = engine.pending_for("cloud");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, ROOT);

    cloud.set_offline(false);
    engine.start();
    tokio::time::timeout(TIMEOUT, engine.wait_for_synced())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cloud.texts(ROOT), vec!["stuck".to_string()]);
    engine.stop().await;
}

#[tokio::test]
async fn test_chaos_dropped_notifications_resubscribe() {
    let local = Arc::new(MemoryDocSource::<OpLogDoc>::new("local"));
    let cloud = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
    let engine = doc_engine(local.clone(), cloud.clone());
    engine.start();
    eventually("cloud subscription", || cloud.subscriber_count() == 1).await;

    cloud.disconnect_subscribers();
    eventually("cloud resubscription", || cloud.subscriber_count() == 1).await;

    let mut collaborator = OpLogDoc::with_client(11);
    cloud.push_remote(ROOT, &collaborator.insert("after reconnect"));
    eventually("remote edit to arrive", || {
        engine.read(ROOT, OpLogDoc::texts).unwrap_or_default() == vec!["after reconnect".to_string()]
    })
    .await;
    engine.stop().await;
}

// =============================================================================
// Blob reconciliation under failure
// =============================================================================

#[tokio::test]
async fn test_chaos_blob_sync_recovers_after_outage() {
    let local = Arc::new(MemoryBlobSource::new("local"));
    let cloud = Arc::new(FailingBlobSource {
        inner: MemoryBlobSource::new("cloud"),
        plan: FailurePlan::after(0),
    });
    let engine = BlobEngine::new(local.clone(), vec![cloud.clone()], &SyncEngineConfig::for_tests()).unwrap();

    let key = engine
        .set(BlobRecord::from_content(b"photo".to_vec(), "image/jpeg"))
        .await
        .unwrap();

    // Listing a shadow fails: the pass completes, the copy is reported failed.
    let report = engine.sync().await.unwrap();
    assert!(!report.is_clean());
    assert!(!cloud.inner.contains(&key));
    assert!(
        engine.current_state(&key).need_upload,
        "an unlisted shadow must keep the key pending"
    );

    // Still pending after another failed pass.
    engine.sync().await.unwrap();
    assert!(engine.current_state(&key).need_upload);

    cloud.plan.heal();
    let report = engine.sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.copied, 1);
    assert!(cloud.inner.contains(&key));
    assert!(!engine.current_state(&key).need_upload);
}
