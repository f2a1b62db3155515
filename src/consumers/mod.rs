//! Stock consumer variants.

mod search;
mod storage;

pub use search::SearchConsumer;
pub use storage::StorageConsumer;
