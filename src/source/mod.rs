//! Sources a replica can sync with.
//!
//! A source is anything that can hold document updates, blobs, or awareness
//! messages: a local cache, a remote server, another in-process replica.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::{MemoryAwarenessHub, MemoryAwarenessSource, MemoryBlobSource, MemoryDocSource};
pub use sqlite::SqliteCacheSource;
pub use traits::{AwarenessSource, BlobSource, DocSource, PulledDoc, RemoteUpdate, RemoteUpdates, SourceError};
