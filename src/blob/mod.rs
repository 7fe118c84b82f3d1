//! Content-addressed blob storage replicated across sources.

pub mod engine;
pub mod types;

pub use engine::BlobEngine;
pub use types::{blob_key, BlobRecord, BlobState, BlobSyncReport};
