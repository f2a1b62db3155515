//! Destination stores written by the stock subscribers.
//!
//! The moderators only need keyed upserts, partition deletes and a handful of
//! schema operations, so the contracts stop there. The in-memory engines back
//! the tests and local runs.

mod memory;
mod search;
mod storage;

pub use memory::{MemorySearch, MemoryStorage};
pub use search::{BulkRequest, SearchBackend};
pub use storage::{table_name, Fields, RowKey, StorageBackend, TableKind, BASE_COLUMNS};
