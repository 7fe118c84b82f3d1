//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::SyncEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncEngineConfig::default();
//! assert_eq!(config.retry_initial_delay_ms, 1000);
//!
//! // Tuned config
//! let config = SyncEngineConfig {
//!     retry_max_delay_ms: 10_000,
//!     queue_warn_depth: 200,
//!     ..Default::default()
//! };
//! assert_eq!(config.retry().max_delay.as_secs(), 10);
//! ```

use std::time::Duration;
use serde::Deserialize;

use crate::resilience::retry::RetryConfig;

/// Configuration for the sync engine.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEngineConfig {
    /// First backoff delay after a transport failure
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,

    /// Pending updates per peer before it is reported as lagging (0 = never)
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,

    /// Blob reconciliation period in seconds (0 = no background loop)
    #[serde(default = "default_blob_sync_interval_secs")]
    pub blob_sync_interval_secs: u64,

    /// Append-log entries per document before the SQLite cache folds them
    #[serde(default = "default_cache_compact_threshold")]
    pub cache_compact_threshold: usize,
}

fn default_retry_initial_delay_ms() -> u64 { 1000 }
fn default_retry_max_delay_ms() -> u64 { 60_000 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_queue_warn_depth() -> usize { 1000 }
fn default_blob_sync_interval_secs() -> u64 { 60 }
fn default_cache_compact_threshold() -> usize { 64 }

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_factor: default_retry_factor(),
            queue_warn_depth: default_queue_warn_depth(),
            blob_sync_interval_secs: default_blob_sync_interval_secs(),
            cache_compact_threshold: default_cache_compact_threshold(),
        }
    }
}

impl SyncEngineConfig {
    /// Backoff used by peers and the blob loop. Never gives up.
    #[must_use]
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_initial_delay_ms)),
            factor: self.retry_factor.max(1.0),
            max_retries: None,
        }
    }

    /// Millisecond backoff for tests.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 10,
            blob_sync_interval_secs: 0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn blob_sync_interval(&self) -> Option<Duration> {
        (self.blob_sync_interval_secs > 0).then(|| Duration::from_secs(self.blob_sync_interval_secs))
    }
}
