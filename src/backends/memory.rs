//! In-process storage and search engines.
//!
//! Both carry an availability switch and per-table failure injection so the
//! retry and redelivery paths can be driven from tests.

use super::search::{BulkRequest, SearchBackend};
use super::storage::{Fields, RowKey, StorageBackend};
use crate::error::{Result, SyncError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct MemTable {
    columns: BTreeSet<String>,
    indexes: BTreeSet<String>,
    rows: BTreeMap<RowKey, Fields>,
    view_of: Option<String>,
}

/// Keyed row store held in memory.
///
/// In strict mode a write naming an unknown column is rejected, the way a
/// real schema would reject it; otherwise unknown columns are added on write.
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, MemTable>>,
    keyspace: AtomicBool,
    available: AtomicBool,
    strict: bool,
    failing: RwLock<HashSet<String>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            keyspace: AtomicBool::new(false),
            available: AtomicBool::new(true),
            strict: false,
            failing: RwLock::new(HashSet::new()),
        }
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every write to `table` fail with a rejection.
    pub fn fail_writes_to(&self, table: &str) {
        self.failing.write().insert(table.to_string());
    }

    pub fn heal_writes_to(&self, table: &str) {
        self.failing.write().remove(table);
    }

    pub fn keyspace_exists(&self) -> bool {
        self.keyspace.load(Ordering::SeqCst)
    }

    /// Every row of `table` in key order (a view yields its base table's rows).
    pub fn rows(&self, table: &str) -> Vec<(RowKey, Fields)> {
        let tables = self.tables.read();
        let Some(mem) = tables.get(table) else {
            return Vec::new();
        };
        let source = match &mem.view_of {
            Some(base) => match tables.get(base) {
                Some(base) => base,
                None => return Vec::new(),
            },
            None => mem,
        };
        source
            .rows
            .iter()
            .map(|(key, fields)| (key.clone(), fields.clone()))
            .collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|mem| mem.columns.contains(column))
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::StorageUnavailable("storage host unreachable".into()))
        }
    }

    fn check_writable(&self, table: &str) -> Result<()> {
        self.check_available()?;
        if self.failing.read().contains(table) {
            return Err(SyncError::StorageRejected {
                table: table.to_string(),
                reason: "write failure injected".into(),
            });
        }
        Ok(())
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&mut MemTable) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write();
        let mem = tables.get_mut(table).ok_or_else(|| SyncError::StorageRejected {
            table: table.to_string(),
            reason: "no such table".into(),
        })?;
        if mem.view_of.is_some() {
            return Err(SyncError::StorageRejected {
                table: table.to_string(),
                reason: "materialized views are read-only".into(),
            });
        }
        f(mem)
    }

    fn admit(strict: bool, table: &str, mem: &mut MemTable, fields: &Fields) -> Result<()> {
        for column in fields.keys() {
            if mem.columns.contains(column) {
                continue;
            }
            if strict {
                return Err(SyncError::StorageRejected {
                    table: table.to_string(),
                    reason: format!("unknown column {column}"),
                });
            }
            mem.columns.insert(column.clone());
        }
        Ok(())
    }
}

impl StorageBackend for MemoryStorage {
    fn is_reachable(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn create_keyspace(&self) -> Result<()> {
        self.check_available()?;
        self.keyspace.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.tables.read().contains_key(table))
    }

    fn create_table(&self, table: &str, columns: &[String]) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let mem = tables.entry(table.to_string()).or_default();
        mem.columns.extend(columns.iter().cloned());
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.check_available()?;
        self.tables.write().remove(table);
        Ok(())
    }

    fn index_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .get(table)
            .is_some_and(|mem| mem.indexes.contains(column)))
    }

    fn create_index(&self, table: &str, column: &str) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let mem = tables.get_mut(table).ok_or_else(|| SyncError::StorageRejected {
            table: table.to_string(),
            reason: "no such table".into(),
        })?;
        if !mem.columns.contains(column) {
            return Err(SyncError::StorageRejected {
                table: table.to_string(),
                reason: format!("cannot index unknown column {column}"),
            });
        }
        mem.indexes.insert(column.to_string());
        Ok(())
    }

    fn create_materialized_view(&self, view: &str, base_table: &str) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write();
        if !tables.contains_key(base_table) {
            return Err(SyncError::StorageRejected {
                table: view.to_string(),
                reason: format!("base table {base_table} missing"),
            });
        }
        tables.entry(view.to_string()).or_insert_with(|| MemTable {
            view_of: Some(base_table.to_string()),
            ..MemTable::default()
        });
        Ok(())
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(match tables.get(table) {
            Some(MemTable {
                view_of: Some(base),
                ..
            }) => tables
                .get(base)
                .map(|mem| mem.columns.iter().cloned().collect())
                .unwrap_or_default(),
            Some(mem) => mem.columns.iter().cloned().collect(),
            None => Vec::new(),
        })
    }

    fn add_column(&self, table: &str, column: &str) -> Result<()> {
        self.check_available()?;
        self.with_table(table, |mem| {
            mem.columns.insert(column.to_string());
            Ok(())
        })
    }

    fn drop_column(&self, table: &str, column: &str) -> Result<()> {
        self.check_available()?;
        // A view's columns follow its base table.
        if self
            .tables
            .read()
            .get(table)
            .is_some_and(|mem| mem.view_of.is_some())
        {
            return Ok(());
        }
        self.with_table(table, |mem| {
            mem.columns.remove(column);
            mem.indexes.remove(column);
            for fields in mem.rows.values_mut() {
                fields.remove(column);
            }
            Ok(())
        })
    }

    fn upsert_row(&self, table: &str, key: &RowKey, fields: &Fields) -> Result<()> {
        self.check_writable(table)?;
        let strict = self.strict;
        self.with_table(table, |mem| {
            Self::admit(strict, table, mem, fields)?;
            let row = mem.rows.entry(key.clone()).or_default();
            for (column, value) in fields {
                row.insert(column.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn upsert_batch(&self, table: &str, rows: &[(RowKey, Fields)]) -> Result<()> {
        self.check_writable(table)?;
        let strict = self.strict;
        self.with_table(table, |mem| {
            // Validate the whole batch before applying any of it.
            for (_, fields) in rows {
                Self::admit(strict, table, mem, fields)?;
            }
            for (key, fields) in rows {
                let row = mem.rows.entry(key.clone()).or_default();
                for (column, value) in fields {
                    row.insert(column.clone(), value.clone());
                }
            }
            Ok(())
        })
    }

    fn delete_row(&self, table: &str, key: &RowKey) -> Result<usize> {
        self.check_writable(table)?;
        self.with_table(table, |mem| {
            let before = mem.rows.len();
            mem.rows.retain(|row_key, _| !key.covers(row_key));
            Ok(before - mem.rows.len())
        })
    }

    fn truncate(&self, table: &str) -> Result<()> {
        self.check_writable(table)?;
        self.with_table(table, |mem| {
            mem.rows.clear();
            Ok(())
        })
    }
}

/// Document indices held in memory.
pub struct MemorySearch {
    indices: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    available: AtomicBool,
    failing: RwLock<HashSet<String>>,
}

impl Default for MemorySearch {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySearch {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_writes_to(&self, index: &str) {
        self.failing.write().insert(index.to_string());
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.indices.read().get(index)?.get(id).cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indices.read().get(index).map_or(0, BTreeMap::len)
    }

    fn check_writable(&self, index: &str) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::SearchUnavailable("search cluster unreachable".into()));
        }
        if self.failing.read().contains(index) {
            return Err(SyncError::SearchRejected {
                index: index.to_string(),
                reason: "write failure injected".into(),
            });
        }
        Ok(())
    }

    fn missing(index: &str) -> SyncError {
        SyncError::SearchRejected {
            index: index.to_string(),
            reason: "no such index".into(),
        }
    }
}

impl SearchBackend for MemorySearch {
    fn is_reachable(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn index_exists(&self, index: &str) -> Result<bool> {
        if !self.is_reachable() {
            return Err(SyncError::SearchUnavailable("search cluster unreachable".into()));
        }
        Ok(self.indices.read().contains_key(index))
    }

    fn create_index(&self, index: &str) -> Result<()> {
        self.check_writable(index)?;
        self.indices.write().entry(index.to_string()).or_default();
        Ok(())
    }

    fn delete_index(&self, index: &str) -> Result<()> {
        self.check_writable(index)?;
        self.indices.write().remove(index);
        Ok(())
    }

    fn index_document(&self, index: &str, id: &str, doc: &Value) -> Result<()> {
        self.check_writable(index)?;
        let mut indices = self.indices.write();
        let docs = indices.get_mut(index).ok_or_else(|| Self::missing(index))?;
        docs.insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn delete_document(&self, index: &str, id: &str) -> Result<()> {
        self.check_writable(index)?;
        let mut indices = self.indices.write();
        let docs = indices.get_mut(index).ok_or_else(|| Self::missing(index))?;
        docs.remove(id);
        Ok(())
    }

    fn bulk(&self, requests: Vec<BulkRequest>) -> Result<()> {
        for request in requests {
            match request {
                BulkRequest::Index { index, id, doc } => self.index_document(&index, &id, &doc)?,
                BulkRequest::Delete { index, id } => self.delete_document(&index, &id)?,
            }
        }
        Ok(())
    }

    fn reindex_range(
        &self,
        source: &str,
        target: &str,
        ids: &[String],
        fields: Option<&[String]>,
    ) -> Result<usize> {
        self.check_writable(target)?;
        let mut indices = self.indices.write();
        let copied: Vec<(String, Value)> = {
            let docs = indices.get(source).ok_or_else(|| Self::missing(source))?;
            ids.iter()
                .filter_map(|id| docs.get(id).map(|doc| (id.clone(), doc.clone())))
                .collect()
        };
        let targets = indices.get_mut(target).ok_or_else(|| Self::missing(target))?;

        for (id, doc) in &copied {
            let merged = match (fields, doc) {
                (Some(fields), Value::Object(source_doc)) => {
                    let mut merged = match targets.get(id) {
                        Some(Value::Object(existing)) => existing.clone(),
                        _ => serde_json::Map::new(),
                    };
                    for field in fields {
                        if let Some(value) = source_doc.get(field) {
                            merged.insert(field.clone(), value.clone());
                        }
                    }
                    Value::Object(merged)
                }
                _ => doc.clone(),
            };
            targets.insert(id.clone(), merged);
        }
        Ok(copied.len())
    }
}
