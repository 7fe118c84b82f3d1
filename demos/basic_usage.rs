// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic doc-sync-engine usage example.
//!
//! Demonstrates:
//! 1. A workspace with a SQLite cache as main source and an in-memory "cloud" shadow
//! 2. Editing documents before and after start
//! 3. Waiting for every source to catch up
//! 4. Storing an attachment and reconciling blobs
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use doc_sync_engine::{
    BlobRecord, MemoryAwarenessHub, MemoryBlobSource, MemoryDocSource, OpLogDoc, SqliteCacheSource, SyncEngine,
    SyncEngineConfig, WorkspaceSources,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let config = SyncEngineConfig::default();
    let cache = Arc::new(SqliteCacheSource::<OpLogDoc>::open_in_memory("local", config.cache_compact_threshold).await?);
    let cloud_docs = Arc::new(MemoryDocSource::<OpLogDoc>::new("cloud"));
    let cloud_blobs = Arc::new(MemoryBlobSource::new("cloud"));
    let hub = MemoryAwarenessHub::new();

    let engine = SyncEngine::<OpLogDoc>::open(
        "workspace",
        WorkspaceSources {
            doc_main: cache.clone(),
            doc_shadows: vec![cloud_docs.clone()],
            blob_main: cache.clone(),
            blob_shadows: vec![cloud_blobs.clone()],
            awareness: vec![Arc::new(hub.source("cloud"))],
        },
        &config,
    )?;
    println!("State: {}", engine.state());

    // Accepted immediately, delivered once the engine runs.
    engine.docs().edit("workspace", |doc| doc.add_sub_doc("page-1"))?;
    engine.docs().edit("page-1", |doc| doc.insert("Meeting notes"))?;

    engine.start().await;
    engine.awareness().awareness().set_local_state(json!({"user": "demo", "cursor": 0}));
    engine.docs().wait_for_synced().await?;
    println!("Cloud copy of page-1: {:?}", cloud_docs.texts("page-1"));

    let key = engine
        .blobs()
        .set(BlobRecord::from_content(b"fake png bytes".to_vec(), "image/png"))
        .await?;
    let report = engine.blobs().sync().await?;
    println!("Blob {key}: copied={} failed={}", report.copied, report.failed);

    let health = engine.health_check();
    println!("Healthy: {} (docs {})", health.is_healthy(), health.doc_status);
    for peer in &health.peers {
        println!("  {} [{:?}] {} pending={}", peer.source, peer.role, peer.step, peer.pending_updates);
    }

    dump_metrics(&snapshotter);

    engine.shutdown().await;
    println!("State: {}", engine.state());
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    println!("Metrics:");
    for line in lines {
        println!("  {line}");
    }
}
