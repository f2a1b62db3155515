//! Idempotency and ordering tracking for a subscriber.
//!
//! The bus does not order messages per entity. Each subscriber keeps the
//! insertion time of the last change it accepted per entity row and rejects
//! anything older, so redelivered or reordered messages cannot roll state
//! back. Deletes pin a key to a sentinel until a create revives it.

mod checkpoint;
mod epoch;
#[allow(clippy::module_inception)]
mod tracker;

pub use checkpoint::CheckpointFile;
pub use epoch::EpochMarker;
pub use tracker::{IdempotencyTracker, DELETED};
