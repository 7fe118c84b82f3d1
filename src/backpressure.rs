// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure reporting for peer queues.
//!
//! A slow or unreachable source makes its peer's queue grow. Local edits are
//! never rejected because of it; the level only feeds status, logs, and
//! metrics so the application can tell the user a source is falling behind.
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::BackpressureLevel;
//!
//! assert_eq!(BackpressureLevel::from_depth(10, 1000), BackpressureLevel::Normal);
//! assert_eq!(BackpressureLevel::from_depth(800, 1000), BackpressureLevel::Warn);
//! assert_eq!(BackpressureLevel::from_depth(1000, 1000), BackpressureLevel::Saturated);
//! ```

/// Queue pressure of one peer.
///
/// - **Normal** (< 70% of the warn depth)
/// - **Warn** (70-100%): source is lagging
/// - **Saturated** (>= 100%): source is effectively unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BackpressureLevel {
    #[default]
    Normal = 0,
    Warn = 1,
    Saturated = 2,
}

impl BackpressureLevel {
    /// Calculate level from a pressure ratio (0.0 → 1.0+)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 1.0 => Self::Warn,
            _ => Self::Saturated,
        }
    }

    /// Calculate level from a queue depth against the configured warn depth.
    #[must_use]
    pub fn from_depth(depth: usize, warn_depth: usize) -> Self {
        if warn_depth == 0 {
            return Self::Normal;
        }
        Self::from_pressure(depth as f64 / warn_depth as f64)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Source lagging behind local edits",
            Self::Saturated => "Source saturated, updates accumulating locally",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
