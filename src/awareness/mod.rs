// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ephemeral presence shared between live collaborators.
//!
//! Nothing here is persisted, queued, or retried. A lost update is repaired
//! by the next one, since every update carries the sender's full state and a
//! clock that only grows.
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::Awareness;
//! use serde_json::json;
//!
//! let alice = Awareness::new(1);
//! let bob = Awareness::new(2);
//!
//! let update = alice.set_local_state(json!({"name": "alice", "cursor": 4}));
//! assert!(bob.apply_remote(update.clone()));
//! assert!(!bob.apply_remote(update)); // stale clock
//! assert_eq!(bob.states()[&1]["cursor"], 4);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::traits::AwarenessSource;

const CHANNEL_CAPACITY: usize = 64;

/// One client's presence as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: u64,
    pub clock: u64,
    /// `None` means the client left.
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChangeKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub client_id: u64,
    pub kind: AwarenessChangeKind,
}

#[derive(Default)]
struct Presence {
    clock: u64,
    local: Option<Value>,
    remote: HashMap<u64, Value>,
    /// Last clock seen per remote client, kept after it leaves so a late
    /// stale update cannot resurrect it.
    seen: HashMap<u64, u64>,
}

/// The shared presence document.
pub struct Awareness {
    client_id: u64,
    presence: Mutex<Presence>,
    outgoing: broadcast::Sender<AwarenessUpdate>,
    changes: broadcast::Sender<AwarenessChange>,
}

impl Awareness {
    #[must_use]
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            presence: Mutex::new(Presence::default()),
            outgoing: broadcast::channel(CHANNEL_CAPACITY).0,
            changes: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Awareness with a random client id.
    #[must_use]
    pub fn random() -> Self {
        Self::new(uuid::Uuid::new_v4().as_u64_pair().0)
    }

    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Replace the local state and announce it.
    pub fn set_local_state(&self, state: Value) -> AwarenessUpdate {
        let update = {
            let mut presence = self.presence.lock();
            presence.clock += 1;
            presence.local = Some(state.clone());
            AwarenessUpdate {
                client_id: self.client_id,
                clock: presence.clock,
                state: Some(state),
            }
        };
        self.announce(update.clone());
        update
    }

    /// Drop the local state and announce that this client left.
    pub fn clear_local_state(&self) -> AwarenessUpdate {
        let update = {
            let mut presence = self.presence.lock();
            presence.clock += 1;
            presence.local = None;
            AwarenessUpdate {
                client_id: self.client_id,
                clock: presence.clock,
                state: None,
            }
        };
        self.announce(update.clone());
        update
    }

    #[must_use]
    pub fn local_state(&self) -> Option<Value> {
        self.presence.lock().local.clone()
    }

    /// The local state under a fresh clock, so receivers that saw an
    /// earlier "left" message accept it again.
    #[must_use]
    pub fn renew_local(&self) -> AwarenessUpdate {
        let mut presence = self.presence.lock();
        presence.clock += 1;
        AwarenessUpdate {
            client_id: self.client_id,
            clock: presence.clock,
            state: presence.local.clone(),
        }
    }

    /// A "left" message that keeps the local state for the next connect.
    #[must_use]
    pub fn leave_update(&self) -> AwarenessUpdate {
        let mut presence = self.presence.lock();
        presence.clock += 1;
        AwarenessUpdate {
            client_id: self.client_id,
            clock: presence.clock,
            state: None,
        }
    }

    /// Merge a remote update. Returns whether anything changed.
    ///
    /// Updates about this client and updates with a clock not newer than
    /// the last one seen are ignored.
    pub fn apply_remote(&self, update: AwarenessUpdate) -> bool {
        if update.client_id == self.client_id {
            return false;
        }

        let kind = {
            let mut presence = self.presence.lock();
            if presence
                .seen
                .get(&update.client_id)
                .is_some_and(|clock| *clock >= update.clock)
            {
                return false;
            }
            presence.seen.insert(update.client_id, update.clock);

            match update.state {
                Some(state) => {
                    match presence.remote.insert(update.client_id, state) {
                        Some(_) => AwarenessChangeKind::Updated,
                        None => AwarenessChangeKind::Added,
                    }
                }
                None => {
                    if presence.remote.remove(&update.client_id).is_none() {
                        return false;
                    }
                    AwarenessChangeKind::Removed
                }
            }
        };

        debug!(client_id = update.client_id, ?kind, "Awareness changed");
        let _ = self.changes.send(AwarenessChange {
            client_id: update.client_id,
            kind,
        });
        true
    }

    /// Every known state keyed by client id, including the local one.
    #[must_use]
    pub fn states(&self) -> HashMap<u64, Value> {
        let presence = self.presence.lock();
        let mut states: HashMap<u64, Value> = presence
            .remote
            .iter()
            .map(|(client, state)| (*client, state.clone()))
            .collect();
        if let Some(local) = &presence.local {
            states.insert(self.client_id, local.clone());
        }
        states
    }

    /// Forget every remote client.
    pub fn clear_remote(&self) {
        let removed: Vec<u64> = self.presence.lock().remote.drain().map(|(c, _)| c).collect();
        for client_id in removed {
            let _ = self.changes.send(AwarenessChange {
                client_id,
                kind: AwarenessChangeKind::Removed,
            });
        }
    }

    /// Local updates, for forwarding to sources.
    #[must_use]
    pub fn subscribe_local(&self) -> broadcast::Receiver<AwarenessUpdate> {
        self.outgoing.subscribe()
    }

    /// Remote add/update/remove notifications.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<AwarenessChange> {
        self.changes.subscribe()
    }

    fn announce(&self, update: AwarenessUpdate) {
        // Nobody connected is fine.
        let _ = self.outgoing.send(update);
    }
}

struct Connection {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Wires every awareness source to one [`Awareness`].
pub struct AwarenessEngine {
    awareness: Arc<Awareness>,
    sources: Vec<Arc<dyn AwarenessSource>>,
    connection: Mutex<Option<Connection>>,
}

impl AwarenessEngine {
    #[must_use]
    pub fn new(awareness: Arc<Awareness>, sources: Vec<Arc<dyn AwarenessSource>>) -> Self {
        Self {
            awareness,
            sources,
            connection: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Start forwarding local updates out and remote updates in, per source.
    #[tracing::instrument(skip(self))]
    pub fn connect(&self) {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handles = self
            .sources
            .iter()
            .map(|source| {
                tokio::spawn(forward(
                    self.awareness.clone(),
                    source.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        *connection = Some(Connection { cancel, handles });
        info!(sources = self.sources.len(), "Awareness connected");
    }

    /// Stop every forwarder after telling the others this client left.
    ///
    /// The awareness document itself is left as is.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        let Some(connection) = connection else {
            return;
        };
        connection.cancel.cancel();
        for handle in connection.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Awareness forwarder ended abnormally");
            }
        }

        let leave = self.awareness.leave_update();
        for source in &self.sources {
            if let Err(e) = source.broadcast(&leave).await {
                debug!(source = %source.name(), error = %e, "Leave message not delivered");
            }
        }
        info!("Awareness disconnected");
    }
}

impl Drop for AwarenessEngine {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.cancel.cancel();
        }
    }
}

async fn forward(awareness: Arc<Awareness>, source: Arc<dyn AwarenessSource>, cancel: CancellationToken) {
    let mut outgoing = awareness.subscribe_local();
    let mut incoming = source.subscribe();
    let mut incoming_open = true;

    let hello = awareness.renew_local();
    if hello.state.is_some() {
        send(source.as_ref(), &hello).await;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = outgoing.recv() => match update {
                Ok(update) => send(source.as_ref(), &update).await,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(source = %source.name(), skipped, "Awareness forwarder lagged, resending current state");
                    send(source.as_ref(), &awareness.renew_local()).await;
                }
                Err(RecvError::Closed) => break,
            },
            update = incoming.recv(), if incoming_open => match update {
                Some(update) => {
                    crate::metrics::record_awareness_message(source.name(), "in");
                    awareness.apply_remote(update);
                }
                None => {
                    debug!(source = %source.name(), "Awareness source closed its channel");
                    incoming_open = false;
                }
            },
        }
    }
}

async fn send(source: &dyn AwarenessSource, update: &AwarenessUpdate) {
    match source.broadcast(update).await {
        Ok(()) => crate::metrics::record_awareness_message(source.name(), "out"),
        Err(e) => debug!(source = %source.name(), error = %e, "Awareness update dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryAwarenessHub;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_higher_clock_wins() {
        let local = Awareness::new(1);
        assert!(local.apply_remote(AwarenessUpdate { client_id: 2, clock: 5, state: Some(json!("b5")) }));
        assert!(!local.apply_remote(AwarenessUpdate { client_id: 2, clock: 4, state: Some(json!("b4")) }));
        assert_eq!(local.states()[&2], json!("b5"));
        assert!(local.apply_remote(AwarenessUpdate { client_id: 2, clock: 6, state: Some(json!("b6")) }));
        assert_eq!(local.states()[&2], json!("b6"));
    }

    #[test]
    fn test_none_state_removes_client() {
        let local = Awareness::new(1);
        let mut changes = local.subscribe_changes();
        local.apply_remote(AwarenessUpdate { client_id: 2, clock: 1, state: Some(json!({})) });
        local.apply_remote(AwarenessUpdate { client_id: 2, clock: 2, state: None });

        assert!(!local.states().contains_key(&2));
        assert_eq!(changes.try_recv().unwrap().kind, AwarenessChangeKind::Added);
        assert_eq!(changes.try_recv().unwrap().kind, AwarenessChangeKind::Removed);

        // A stale state from before the leave does not bring it back.
        assert!(!local.apply_remote(AwarenessUpdate { client_id: 2, clock: 1, state: Some(json!({})) }));
    }

    #[test]
    fn test_own_updates_ignored() {
        let local = Awareness::new(1);
        assert!(!local.apply_remote(AwarenessUpdate { client_id: 1, clock: 99, state: Some(json!(1)) }));
        assert!(local.states().is_empty());
    }

    #[test]
    fn test_states_include_local() {
        let local = Awareness::new(7);
        local.set_local_state(json!({"cursor": 1}));
        assert_eq!(local.states()[&7], json!({"cursor": 1}));
        local.clear_local_state();
        assert!(local.states().is_empty());
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn test_engines_exchange_presence() {
        let hub = MemoryAwarenessHub::new();
        let alice = Arc::new(Awareness::new(1));
        let bob = Arc::new(Awareness::new(2));
        let alice_engine = AwarenessEngine::new(alice.clone(), vec![Arc::new(hub.source("alice"))]);
        let bob_engine = AwarenessEngine::new(bob.clone(), vec![Arc::new(hub.source("bob"))]);

        alice_engine.connect();
        bob_engine.connect();
        eventually(|| hub.subscriber_count() == 2).await;

        alice.set_local_state(json!({"name": "alice"}));
        eventually(|| bob.states().contains_key(&1)).await;

        alice_engine.disconnect().await;
        eventually(|| !bob.states().contains_key(&1)).await;
        assert_eq!(alice.local_state(), Some(json!({"name": "alice"})));

        bob_engine.disconnect().await;
        assert!(!bob_engine.is_connected());
    }
}
