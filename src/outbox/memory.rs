//! In-memory outbox tables.

use super::OutboxStore;
use crate::error::{Result, SyncError};
use crate::types::{OutboxInput, OutboxRow, ProducerBit, ProducerMask, RowId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Outbox held in memory, one ordered table per entity type.
pub struct MemoryOutbox {
    tables: RwLock<HashMap<String, BTreeMap<RowId, OutboxRow>>>,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Stage a change (the upstream capture side).
    pub fn insert(&self, input: OutboxInput) -> RowId {
        let row_id = RowId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let row = OutboxRow {
            row_id,
            entity_id: input.entity_id,
            entity_type: input.entity_type,
            kind: input.kind,
            action: input.action,
            payload: input.payload,
            encoding: input.encoding,
            insertion_time: input.insertion_time,
            priority: input.priority,
            producer_status: ProducerMask::default(),
        };
        self.tables
            .write()
            .entry(row.entity_type.clone())
            .or_default()
            .insert(row_id, row);
        row_id
    }

    pub fn get(&self, entity_type: &str, row_id: RowId) -> Option<OutboxRow> {
        self.tables
            .read()
            .get(entity_type)
            .and_then(|table| table.get(&row_id).cloned())
    }

    /// Rows left in the table for `entity_type`.
    pub fn len(&self, entity_type: &str) -> usize {
        self.tables.read().get(entity_type).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, entity_type: &str) -> bool {
        self.len(entity_type) == 0
    }

    /// Simulate the outbox database going away.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::StorageUnavailable("outbox unreachable".into()))
        }
    }
}

impl Default for MemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxStore for MemoryOutbox {
    fn select_pending(
        &self,
        entity_type: &str,
        bit: ProducerBit,
        limit: usize,
    ) -> Result<Vec<OutboxRow>> {
        self.check_available()?;
        let tables = self.tables.read();
        let Some(table) = tables.get(entity_type) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&OutboxRow> = table
            .values()
            .filter(|row| !row.producer_status.contains(bit))
            .collect();
        // BTreeMap iteration is already row-id order, so a stable sort keeps
        // insertion order within a priority.
        rows.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    fn mark_processed(
        &self,
        entity_type: &str,
        rows: &[RowId],
        bit: ProducerBit,
    ) -> Result<usize> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(entity_type) else {
            return Ok(0);
        };

        let mut touched = 0;
        for row_id in rows {
            if let Some(row) = table.get_mut(row_id) {
                row.producer_status = row.producer_status.with(bit);
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn delete_completed(&self, entity_type: &str, full: ProducerMask) -> Result<usize> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(entity_type) else {
            return Ok(0);
        };

        let before = table.len();
        table.retain(|_, row| !row.producer_status.is_complete(full));
        Ok(before - table.len())
    }
}
