// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for doc-sync-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `doc_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size counters
//!
//! # Labels
//! - `source`: source name as given by `DocSource::name()` / `BlobSource::name()`
//! - `operation`: pull, push, subscribe, get, set, delete, list, upload
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// DOCUMENT PEERS
// ═══════════════════════════════════════════════════════════════════════════

/// Record one call against a source
pub fn record_source_op(source: &str, operation: &str, status: &str) {
    counter!(
        "doc_sync_source_operations_total",
        "source" => source.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the step gauge of a peer (see `PeerStep::as_u8`)
pub fn set_peer_step(source: &str, step: u8) {
    gauge!(
        "doc_sync_peer_step",
        "source" => source.to_string()
    )
    .set(step as f64);
}

/// Record a retry after a transient failure
pub fn record_retry(source: &str) {
    counter!(
        "doc_sync_retries_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Set the pending-update depth of a peer queue
pub fn set_queue_depth(source: &str, depth: usize) {
    gauge!(
        "doc_sync_queue_depth",
        "source" => source.to_string()
    )
    .set(depth as f64);
}

/// Record a peer that stopped on a hard error
pub fn record_peer_failure(source: &str) {
    counter!(
        "doc_sync_peer_failures_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record bytes pushed to a source
pub fn record_bytes_pushed(source: &str, bytes: usize) {
    counter!(
        "doc_sync_pushed_bytes_total",
        "source" => source.to_string()
    )
    .increment(bytes as u64);
}

/// Record bytes pulled from a source
pub fn record_bytes_pulled(source: &str, bytes: usize) {
    counter!(
        "doc_sync_pulled_bytes_total",
        "source" => source.to_string()
    )
    .increment(bytes as u64);
}

/// Set the engine-level sync status (0 = Stopped, 1 = Syncing, 2 = Synced)
pub fn set_doc_status(status: u8) {
    gauge!("doc_sync_doc_status").set(status as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BLOBS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a blob copied between sources
pub fn record_blob_transfer(from: &str, to: &str, bytes: usize) {
    counter!(
        "doc_sync_blob_transfers_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
    counter!(
        "doc_sync_blob_transferred_bytes_total",
        "to" => to.to_string()
    )
    .increment(bytes as u64);
}

/// Record a blob skipped because it exceeds a source's size limit
pub fn record_blob_over_size(source: &str) {
    counter!(
        "doc_sync_blob_over_size_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record the outcome of one reconciliation pass
pub fn record_blob_sync_pass(duration: Duration, copied: usize, failed: usize) {
    histogram!("doc_sync_blob_sync_seconds").record(duration.as_secs_f64());
    counter!("doc_sync_blob_sync_copied_total").increment(copied as u64);
    counter!("doc_sync_blob_sync_failed_total").increment(failed as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// AWARENESS
// ═══════════════════════════════════════════════════════════════════════════

/// Record an awareness message (`direction`: in, out)
pub fn record_awareness_message(source: &str, direction: &str) {
    counter!(
        "doc_sync_awareness_messages_total",
        "source" => source.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Set engine lifecycle state (as label)
pub fn set_engine_state(state: &str) {
    for s in ["Created", "Running", "ShuttingDown"] {
        gauge!("doc_sync_engine_state", "state" => s).set(if s == state { 1.0 } else { 0.0 });
    }
}

/// Record a lifecycle phase duration
pub fn record_lifecycle_phase(phase: &str, duration: Duration) {
    histogram!(
        "doc_sync_lifecycle_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records a lifecycle phase on drop
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        record_lifecycle_phase(self.phase, self.start.elapsed());
    }
}
