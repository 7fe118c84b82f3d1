//! Blob reconciliation across a local SQLite cache and remote stores.
//!
//! Run with: `cargo test --test blob_sync`

use std::sync::Arc;
use std::time::Duration;

use doc_sync_engine::{
    blob_key, BlobEngine, BlobRecord, BlobSource, MemoryBlobSource, OpLogDoc, SqliteCacheSource, SyncEngineConfig,
};

type Cache = SqliteCacheSource<OpLogDoc>;

async fn cache() -> Arc<Cache> {
    Arc::new(Cache::open_in_memory("local", 64).await.expect("in-memory sqlite"))
}

fn record(content: &[u8]) -> BlobRecord {
    BlobRecord::from_content(content.to_vec(), "application/octet-stream")
}

#[tokio::test]
async fn test_local_writes_reach_every_writable_shadow() {
    let local = cache().await;
    let cloud = Arc::new(MemoryBlobSource::new("cloud"));
    let archive = Arc::new(MemoryBlobSource::new("archive").readonly());
    let engine = BlobEngine::new(local.clone(), vec![cloud.clone(), archive.clone()], &SyncEngineConfig::for_tests())
        .unwrap();

    let key = engine.set(record(b"diagram")).await.unwrap();
    assert_eq!(key, blob_key(b"diagram"));
    assert!(engine.current_state(&key).need_upload);

    let report = engine.sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.copied, 1);
    assert!(cloud.contains(&key));
    assert!(!archive.contains(&key));
    assert!(!engine.current_state(&key).need_upload);
}

#[tokio::test]
async fn test_remote_blobs_are_downloaded_into_cache() {
    let local = cache().await;
    let cloud = Arc::new(MemoryBlobSource::new("cloud"));
    let remote = record(b"uploaded elsewhere");
    cloud.insert(remote.clone());

    let engine = BlobEngine::new(local.clone(), vec![cloud.clone()], &SyncEngineConfig::for_tests()).unwrap();
    assert_eq!(engine.list().await.unwrap(), vec![remote.key.clone()]);

    let report = engine.sync().await.unwrap();
    assert_eq!(report.copied, 1);
    assert_eq!(local.get(&remote.key).await.unwrap(), Some(remote));
}

#[tokio::test]
async fn test_get_falls_back_to_shadow_and_caches() {
    let local = cache().await;
    let cloud = Arc::new(MemoryBlobSource::new("cloud"));
    let remote = record(b"only in the cloud");
    cloud.insert(remote.clone());

    let engine = BlobEngine::new(local.clone(), vec![cloud], &SyncEngineConfig::for_tests()).unwrap();
    assert_eq!(engine.get(&remote.key).await.unwrap(), Some(remote.clone()));
    assert!(local.has(&remote.key).await.unwrap());
}

#[tokio::test]
async fn test_small_shadow_reports_over_size_not_failure() {
    let local = cache().await;
    let mobile = Arc::new(MemoryBlobSource::new("mobile").with_max_blob_size(4));
    let engine = BlobEngine::new(local, vec![mobile.clone()], &SyncEngineConfig::for_tests()).unwrap();

    let key = engine.set(record(b"much larger than four bytes")).await.unwrap();
    let report = engine.sync().await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.over_size, 1);
    assert!(!mobile.contains(&key));
    assert!(engine.current_state(&key).over_size);
}

#[tokio::test]
async fn test_over_size_clears_after_quota_upgrade() {
    let local = cache().await;
    let mobile = Arc::new(MemoryBlobSource::new("mobile").with_max_blob_size(2));
    let engine = BlobEngine::new(local, vec![mobile.clone()], &SyncEngineConfig::for_tests()).unwrap();

    let key = engine.set(record(b"a full resolution photo")).await.unwrap();
    let report = engine.sync().await.unwrap();
    assert_eq!(report.over_size, 1);
    assert!(engine.current_state(&key).over_size);

    mobile.set_max_blob_size(Some(1024 * 1024));
    let report = engine.sync().await.unwrap();
    assert_eq!(report.copied, 1);
    assert!(mobile.contains(&key));
    assert!(!engine.current_state(&key).over_size);

    let report = engine.sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.over_size, 0);
    assert!(!engine.current_state(&key).over_size);
}

#[tokio::test]
async fn test_delete_removes_everywhere_writable() {
    let local = cache().await;
    let cloud = Arc::new(MemoryBlobSource::new("cloud"));
    let engine = BlobEngine::new(local.clone(), vec![cloud.clone()], &SyncEngineConfig::for_tests()).unwrap();

    let key = engine.set(record(b"temporary")).await.unwrap();
    engine.sync().await.unwrap();
    assert!(cloud.contains(&key));

    engine.delete(&key).await.unwrap();
    assert!(!cloud.contains(&key));
    assert!(engine.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_background_loop_runs_a_pass_on_start() {
    let local = cache().await;
    let cloud = Arc::new(MemoryBlobSource::new("cloud"));
    let engine = Arc::new(BlobEngine::new(local, vec![cloud.clone()], &SyncEngineConfig::for_tests()).unwrap());

    let key = engine.set(record(b"queued before start")).await.unwrap();
    engine.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cloud.contains(&key) {
        assert!(tokio::time::Instant::now() < deadline, "blob never reached the cloud");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.stop().await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_blob_state_receiver_sees_upload() {
    let local = cache().await;
    let cloud = Arc::new(MemoryBlobSource::new("cloud"));
    let engine = BlobEngine::new(local, vec![cloud], &SyncEngineConfig::for_tests()).unwrap();

    let key = engine.set(record(b"watched")).await.unwrap();
    let mut state = engine.blob_state(&key);
    assert!(state.borrow_and_update().need_upload);

    engine.sync().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| !s.need_upload && !s.uploading))
        .await
        .unwrap()
        .unwrap();
}
