//! Durable outbox of pending change rows.
//!
//! One table per managed entity type. Rows are written by upstream change
//! capture, read page by page by each producer, stamped with that producer's
//! completion bit once sent, and deleted once every registered producer has
//! stamped them.

mod memory;

pub use memory::MemoryOutbox;

use crate::error::Result;
use crate::types::{OutboxRow, ProducerBit, ProducerMask, RowId};

/// Outbox table operations the producer depends on.
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` rows of `entity_type` not yet sent by `bit`, ordered by
    /// priority descending then insertion order.
    fn select_pending(
        &self,
        entity_type: &str,
        bit: ProducerBit,
        limit: usize,
    ) -> Result<Vec<OutboxRow>>;

    /// Set `bit` on the given rows (one batched update). Returns rows touched.
    fn mark_processed(&self, entity_type: &str, rows: &[RowId], bit: ProducerBit)
        -> Result<usize>;

    /// Delete rows whose bitmask contains every bit of `full`. Returns rows deleted.
    fn delete_completed(&self, entity_type: &str, full: ProducerMask) -> Result<usize>;
}
