//! Update queue primitives shared by the document and blob engines.

pub mod async_queue;
pub mod priority;

pub use async_queue::AsyncQueue;
pub use priority::{Identified, PriorityAsyncQueue, SharedPriorityTarget};
