// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Peers never give up on a transient source failure: they sit in
//! `Retrying`, back off, and re-attempt the exact same operation.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::RetryConfig;
//! use std::time::Duration;
//!
//! // Peers: never give up on a source
//! let peer = RetryConfig::peer();
//! assert_eq!(peer.max_retries, None);
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let mut backoff = RetryConfig {
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_millis(250),
//!     factor: 2.0,
//!     max_retries: None,
//! }.backoff();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(250));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::peer()`] - Infinite retry for peer loops
/// - [`RetryConfig::startup()`] - Fast-fail for opening local storage
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::peer()
    }
}

impl RetryConfig {
    /// Infinite retry for a peer talking to its source.
    /// Backs off exponentially from 1 second, capped at 1 minute.
    #[must_use]
    pub fn peer() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }

    /// Fast-fail retry for opening local storage.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Minimal delays, infinite retries. Meant for tests driving chaos sources.
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Start a fresh backoff sequence.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            factor: self.factor,
            attempts: 0,
        }
    }
}

/// Stateful exponential backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
    attempts: usize,
}

impl Backoff {
    /// Delay to wait before the next attempt; grows until capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = delay.mul_f64(self.factor).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = config.backoff();

    loop {
        match operation().await {
            Ok(val) => {
                if backoff.attempts() > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, backoff.attempts());
                }
                return Ok(val);
            }
            Err(err) => {
                let attempts = backoff.attempts() + 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    error = %err,
                    ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
