//! Minimal operation-log CRDT.
//!
//! Every operation is identified by `(client, clock)`. A document is the set
//! of operations it has seen, so merging is set union: commutative,
//! associative and idempotent. State vectors are exact per-client clock
//! ranges, which keeps diffs correct even when a replica received a client's
//! operations out of order through different sources.
//!
//! Updates travel as a versioned JSON envelope. An envelope with a foreign
//! version is a hard [`CrdtError::VersionMismatch`].
//!
//! # Example
//!
//! ```
//! use doc_sync_engine::{CrdtDoc, OpLogDoc};
//!
//! let mut alice = OpLogDoc::with_client(1);
//! let mut bob = OpLogDoc::with_client(2);
//!
//! let a = alice.insert("hello");
//! let b = bob.insert("world");
//! alice.apply_update(&b).unwrap();
//! bob.apply_update(&a).unwrap();
//!
//! assert_eq!(alice.state_vector(), bob.state_vector());
//! assert_eq!(alice.texts(), bob.texts());
//! ```

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use super::crdt::{CrdtDoc, CrdtError};
use super::DocId;

const UPDATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    Insert { text: String },
    SubDoc { id: DocId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Op {
    client: u64,
    clock: u64,
    op: OpKind,
}

#[derive(Serialize, Deserialize)]
struct UpdateEnvelope {
    v: u32,
    ops: Vec<Op>,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    v: u32,
}

/// Inclusive clock ranges per client.
type StateVector = BTreeMap<u64, Vec<(u64, u64)>>;

#[derive(Debug, Clone)]
pub struct OpLogDoc {
    client: u64,
    ops: BTreeMap<(u64, u64), OpKind>,
}

impl Default for OpLogDoc {
    fn default() -> Self {
        Self::with_client(uuid::Uuid::new_v4().as_u64_pair().0)
    }
}

impl OpLogDoc {
    #[must_use]
    pub fn with_client(client: u64) -> Self {
        Self {
            client,
            ops: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client
    }

    /// Append a text entry; returns the update to broadcast.
    pub fn insert(&mut self, text: impl Into<String>) -> Vec<u8> {
        self.local_op(OpKind::Insert { text: text.into() })
    }

    /// Reference a sub-document; returns the update to broadcast.
    pub fn add_sub_doc(&mut self, id: impl Into<DocId>) -> Vec<u8> {
        self.local_op(OpKind::SubDoc { id: id.into() })
    }

    /// Text entries in a replica-independent order.
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        let mut entries: Vec<(&(u64, u64), &String)> = self
            .ops
            .iter()
            .filter_map(|(key, op)| match op {
                OpKind::Insert { text } => Some((key, text)),
                OpKind::SubDoc { .. } => None,
            })
            .collect();
        entries.sort_by_key(|((client, clock), _)| (*clock, *client));
        entries.into_iter().map(|(_, text)| text.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn local_op(&mut self, op: OpKind) -> Vec<u8> {
        let clock = self
            .ops
            .range((self.client, 0)..=(self.client, u64::MAX))
            .next_back()
            .map_or(1, |((_, clock), _)| clock + 1);
        self.ops.insert((self.client, clock), op.clone());
        encode_ops(vec![Op { client: self.client, clock, op }])
    }

    fn vector(&self) -> StateVector {
        let mut vector: StateVector = BTreeMap::new();
        for (client, clock) in self.ops.keys() {
            let ranges = vector.entry(*client).or_default();
            if let Some((_, end)) = ranges.last_mut() {
                if *end + 1 == *clock {
                    *end = *clock;
                    continue;
                }
            }
            ranges.push((*clock, *clock));
        }
        vector
    }
}

fn encode_ops(ops: Vec<Op>) -> Vec<u8> {
    if ops.is_empty() {
        return Vec::new();
    }
    // Serializing plain structs/maps into a Vec cannot fail.
    serde_json::to_vec(&UpdateEnvelope { v: UPDATE_VERSION, ops }).unwrap_or_default()
}

fn decode_ops(update: &[u8]) -> Result<Vec<Op>, CrdtError> {
    if update.is_empty() {
        return Ok(Vec::new());
    }
    let header: EnvelopeHeader =
        serde_json::from_slice(update).map_err(|e| CrdtError::Malformed(e.to_string()))?;
    if header.v != UPDATE_VERSION {
        return Err(CrdtError::VersionMismatch {
            expected: UPDATE_VERSION,
            found: header.v,
        });
    }
    let envelope: UpdateEnvelope =
        serde_json::from_slice(update).map_err(|e| CrdtError::Malformed(e.to_string()))?;
    Ok(envelope.ops)
}

fn decode_vector(bytes: &[u8]) -> Result<StateVector, CrdtError> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_slice(bytes).map_err(|e| CrdtError::Malformed(format!("state vector: {}", e)))
}

fn vector_contains(vector: &StateVector, client: u64, clock: u64) -> bool {
    vector
        .get(&client)
        .is_some_and(|ranges| ranges.iter().any(|(start, end)| (*start..=*end).contains(&clock)))
}

impl CrdtDoc for OpLogDoc {
    fn state_vector(&self) -> Vec<u8> {
        serde_json::to_vec(&self.vector()).unwrap_or_default()
    }

    fn diff_since(&self, remote_state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError> {
        let remote = match remote_state_vector {
            Some(bytes) => decode_vector(bytes)?,
            None => BTreeMap::new(),
        };
        let ops = self
            .ops
            .iter()
            .filter(|((client, clock), _)| !vector_contains(&remote, *client, *clock))
            .map(|((client, clock), op)| Op {
                client: *client,
                clock: *clock,
                op: op.clone(),
            })
            .collect();
        Ok(encode_ops(ops))
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<(), CrdtError> {
        for op in decode_ops(update)? {
            self.ops.entry((op.client, op.clock)).or_insert(op.op);
        }
        Ok(())
    }

    fn sub_doc_ids(&self) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self
            .ops
            .values()
            .filter_map(|op| match op {
                OpKind::SubDoc { id } => Some(id.clone()),
                OpKind::Insert { .. } => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, CrdtError> {
        let mut merged: BTreeMap<(u64, u64), OpKind> = BTreeMap::new();
        for update in updates {
            for op in decode_ops(update)? {
                merged.entry((op.client, op.clock)).or_insert(op.op);
            }
        }
        let ops = merged
            .into_iter()
            .map(|((client, clock), op)| Op { client, clock, op })
            .collect();
        Ok(encode_ops(ops))
    }
}
