//! Peer and engine status.
//!
//! Each peer reports into a shared [`StatusBoard`]; the board recomputes the
//! engine-level [`DocEngineState`] on every transition and publishes it on a
//! `watch` channel.

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backpressure::BackpressureLevel;

/// Progress of one peer. Declaration order is progress order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerStep {
    /// Loop not running.
    Stopped,
    /// Backing off after a transport failure.
    Retrying,
    LoadingRootDoc,
    LoadingSubDoc,
    /// Everything needed is local, not yet confirmed caught up.
    Loaded,
    Syncing,
    Synced,
}

impl PeerStep {
    /// Display-only progress in `0.0..=1.0`, for progress bars.
    #[must_use]
    pub fn progress_score(&self) -> f64 {
        match self {
            Self::Stopped | Self::Retrying => 0.0,
            Self::LoadingRootDoc => 0.2,
            Self::LoadingSubDoc => 0.4,
            Self::Loaded => 0.6,
            Self::Syncing => 0.8,
            Self::Synced => 1.0,
        }
    }

    /// Metric encoding.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for PeerStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Main,
    Shadow,
}

/// State of one (replica, source) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerState {
    pub source: String,
    pub role: PeerRole,
    pub step: PeerStep,
    pub retry_count: u32,
    /// Updates queued for this source, not yet pushed.
    pub pending_updates: usize,
    pub pressure: BackpressureLevel,
    /// The root document has been loaded from this source at least once.
    pub root_loaded: bool,
    /// Set when the peer stopped on a hard error.
    pub last_error: Option<String>,
}

impl PeerState {
    #[must_use]
    pub fn new(source: impl Into<String>, role: PeerRole) -> Self {
        Self {
            source: source.into(),
            role,
            step: PeerStep::Stopped,
            retry_count: 0,
            pending_updates: 0,
            pressure: BackpressureLevel::Normal,
            root_loaded: false,
            last_error: None,
        }
    }
}

/// Engine-level sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Stopped,
    Syncing,
    Synced,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Snapshot published on every peer transition.
#[derive(Debug, Clone, PartialEq)]
pub struct DocEngineState {
    pub status: SyncStatus,
    pub peers: Vec<PeerState>,
    /// Any peer currently backing off.
    pub retrying: bool,
    /// The main peer has loaded the root document.
    pub root_loaded: bool,
    /// First hard error reported by any peer.
    pub error: Option<String>,
}

impl DocEngineState {
    fn derive(started: bool, peers: &[PeerState]) -> Self {
        let status = if !started {
            SyncStatus::Stopped
        } else if peers.iter().all(|p| p.step == PeerStep::Synced) {
            SyncStatus::Synced
        } else {
            SyncStatus::Syncing
        };
        Self {
            status,
            peers: peers.to_vec(),
            retrying: peers.iter().any(|p| p.step == PeerStep::Retrying),
            root_loaded: peers
                .iter()
                .any(|p| p.role == PeerRole::Main && p.root_loaded),
            error: peers.iter().find_map(|p| p.last_error.clone()),
        }
    }
}

struct Board {
    started: bool,
    peers: Vec<PeerState>,
}

/// Shared registry of peer states.
pub(crate) struct StatusBoard {
    board: Mutex<Board>,
    tx: watch::Sender<DocEngineState>,
    queue_warn_depth: usize,
}

impl StatusBoard {
    pub(crate) fn new(queue_warn_depth: usize) -> Self {
        let (tx, _) = watch::channel(DocEngineState::derive(false, &[]));
        Self {
            board: Mutex::new(Board {
                started: false,
                peers: Vec::new(),
            }),
            tx,
            queue_warn_depth,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DocEngineState> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> DocEngineState {
        self.tx.borrow().clone()
    }

    pub(crate) fn set_started(&self, started: bool) {
        let mut board = self.board.lock();
        board.started = started;
        self.publish(&board);
    }

    pub(crate) fn insert(&self, state: PeerState) {
        let mut board = self.board.lock();
        board.peers.retain(|p| p.source != state.source);
        board.peers.push(state);
        self.publish(&board);
    }

    pub(crate) fn remove(&self, source: &str) {
        let mut board = self.board.lock();
        board.peers.retain(|p| p.source != source);
        self.publish(&board);
    }

    pub(crate) fn peer(&self, source: &str) -> Option<PeerState> {
        self.board.lock().peers.iter().find(|p| p.source == source).cloned()
    }

    fn update<F>(&self, source: &str, f: F)
    where
        F: FnOnce(&mut PeerState),
    {
        let mut board = self.board.lock();
        let Some(peer) = board.peers.iter_mut().find(|p| p.source == source) else {
            return;
        };
        f(peer);
        self.publish(&board);
    }

    fn publish(&self, board: &Board) {
        let next = DocEngineState::derive(board.started, &board.peers);
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                if current.status != next.status {
                    info!(from = %current.status, to = %next.status, "Engine status changed");
                    crate::metrics::set_doc_status(next.status as u8);
                }
                *current = next;
                true
            }
        });
    }
}

/// A peer's handle onto the board.
#[derive(Clone)]
pub(crate) struct PeerReporter {
    source: String,
    board: Arc<StatusBoard>,
}

impl PeerReporter {
    pub(crate) fn new(source: impl Into<String>, board: Arc<StatusBoard>) -> Self {
        Self {
            source: source.into(),
            board,
        }
    }

    pub(crate) fn step(&self, step: PeerStep) {
        self.board.update(&self.source, |peer| {
            if peer.step != step {
                info!(source = %peer.source, from = %peer.step, to = %step, "Peer step changed");
                crate::metrics::set_peer_step(&peer.source, step.as_u8());
            }
            peer.step = step;
            if step != PeerStep::Retrying {
                peer.retry_count = 0;
            }
        });
    }

    pub(crate) fn retrying(&self, error: &str) {
        self.board.update(&self.source, |peer| {
            peer.step = PeerStep::Retrying;
            peer.retry_count += 1;
            warn!(source = %peer.source, retry_count = peer.retry_count, error, "Peer retrying");
            crate::metrics::set_peer_step(&peer.source, PeerStep::Retrying.as_u8());
            crate::metrics::record_retry(&peer.source);
        });
    }

    pub(crate) fn root_loaded(&self) {
        self.board.update(&self.source, |peer| peer.root_loaded = true);
    }

    pub(crate) fn failed(&self, error: &str) {
        self.board.update(&self.source, |peer| {
            peer.step = PeerStep::Stopped;
            peer.last_error = Some(error.to_string());
            crate::metrics::set_peer_step(&peer.source, PeerStep::Stopped.as_u8());
        });
    }

    pub(crate) fn clear_error(&self) {
        self.board.update(&self.source, |peer| peer.last_error = None);
    }

    /// Record queue depth; an update landing on a `Synced` peer makes it `Syncing`.
    pub(crate) fn pending(&self, depth: usize, enqueued: bool) {
        let warn_depth = self.board.queue_warn_depth;
        self.board.update(&self.source, |peer| {
            peer.pending_updates = depth;
            let pressure = BackpressureLevel::from_depth(depth, warn_depth);
            if pressure > peer.pressure {
                warn!(source = %peer.source, depth, level = %pressure, "{}", pressure.description());
            }
            peer.pressure = pressure;
            if enqueued && peer.step == PeerStep::Synced {
                peer.step = PeerStep::Syncing;
            }
            crate::metrics::set_queue_depth(&peer.source, depth);
        });
    }

    pub(crate) fn current(&self) -> Option<PeerState> {
        self.board.peer(&self.source)
    }

    /// Settle to `Synced` or `Syncing` atomically with respect to enqueues.
    ///
    /// An enqueue racing this call either lands before `is_idle` runs, or
    /// flips the step back to `Syncing` right after the board is released.
    pub(crate) fn settle<F>(&self, is_idle: F)
    where
        F: FnOnce() -> bool,
    {
        self.board.update(&self.source, |peer| {
            let step = if is_idle() { PeerStep::Synced } else { PeerStep::Syncing };
            if peer.step != step {
                info!(source = %peer.source, from = %peer.step, to = %step, "Peer step changed");
                crate::metrics::set_peer_step(&peer.source, step.as_u8());
            }
            peer.step = step;
            peer.retry_count = 0;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with(names: &[(&str, PeerRole)]) -> (Arc<StatusBoard>, Vec<PeerReporter>) {
        let board = Arc::new(StatusBoard::new(10));
        let reporters = names
            .iter()
            .map(|(name, role)| {
                board.insert(PeerState::new(*name, *role));
                PeerReporter::new(*name, board.clone())
            })
            .collect();
        (board, reporters)
    }

    #[test]
    fn test_step_ordering_is_progress_ordering() {
        assert!(PeerStep::Stopped < PeerStep::Retrying);
        assert!(PeerStep::Retrying < PeerStep::LoadingRootDoc);
        assert!(PeerStep::LoadingSubDoc < PeerStep::Loaded);
        assert!(PeerStep::Loaded < PeerStep::Syncing);
        assert!(PeerStep::Syncing < PeerStep::Synced);
        assert!(PeerStep::Loaded.progress_score() > PeerStep::LoadingSubDoc.progress_score());
        assert_eq!(PeerStep::Synced.progress_score(), 1.0);
    }

    #[test]
    fn test_status_stopped_until_started() {
        let (board, reporters) = board_with(&[("main", PeerRole::Main)]);
        reporters[0].step(PeerStep::Synced);
        assert_eq!(board.current().status, SyncStatus::Stopped);

        board.set_started(true);
        assert_eq!(board.current().status, SyncStatus::Synced);
    }

    #[test]
    fn test_synced_requires_every_peer() {
        let (board, reporters) = board_with(&[("main", PeerRole::Main), ("shadow", PeerRole::Shadow)]);
        board.set_started(true);

        reporters[0].step(PeerStep::Synced);
        assert_eq!(board.current().status, SyncStatus::Syncing);

        reporters[1].step(PeerStep::Synced);
        assert_eq!(board.current().status, SyncStatus::Synced);
    }

    #[test]
    fn test_enqueue_flips_synced_peer_to_syncing() {
        let (board, reporters) = board_with(&[("main", PeerRole::Main)]);
        board.set_started(true);
        reporters[0].step(PeerStep::Synced);

        reporters[0].pending(1, true);
        assert_eq!(board.current().status, SyncStatus::Syncing);
        assert_eq!(board.current().peers[0].pending_updates, 1);
    }

    #[test]
    fn test_retry_count_resets_on_progress() {
        let (board, reporters) = board_with(&[("main", PeerRole::Main)]);
        board.set_started(true);
        reporters[0].retrying("offline");
        reporters[0].retrying("offline");
        let state = board.current();
        assert!(state.retrying);
        assert_eq!(state.peers[0].retry_count, 2);

        reporters[0].step(PeerStep::Syncing);
        assert_eq!(board.current().peers[0].retry_count, 0);
    }

    #[test]
    fn test_pressure_follows_depth() {
        let (board, reporters) = board_with(&[("slow", PeerRole::Shadow)]);
        reporters[0].pending(8, true);
        assert_eq!(board.current().peers[0].pressure, BackpressureLevel::Warn);
        reporters[0].pending(12, true);
        assert_eq!(board.current().peers[0].pressure, BackpressureLevel::Saturated);
        reporters[0].pending(0, false);
        assert_eq!(board.current().peers[0].pressure, BackpressureLevel::Normal);
    }

    #[test]
    fn test_failure_surfaces_error_and_root_loaded_tracks_main() {
        let (board, reporters) = board_with(&[("main", PeerRole::Main), ("shadow", PeerRole::Shadow)]);
        reporters[1].root_loaded();
        assert!(!board.current().root_loaded);
        reporters[0].root_loaded();
        assert!(board.current().root_loaded);

        reporters[1].failed("bad envelope");
        let state = board.current();
        assert_eq!(state.error.as_deref(), Some("bad envelope"));
        assert_eq!(state.peers[1].step, PeerStep::Stopped);
    }
}
