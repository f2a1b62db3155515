//! Per-subscriber state shared by the moderators.

use crate::backends::StorageBackend;
use crate::error::Result;
use crate::retry::{with_fixed_delay, RetryPolicy};
use crate::shutdown::Shutdown;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tables whose column sets are remembered.
const COLUMN_CACHE_TABLES: usize = 256;

/// Storage handle, core-type set and a cache of known columns per table.
///
/// Owned by one subscriber and handed to its moderators; nothing here is
/// process-wide.
pub struct ModerationContext {
    storage: Arc<dyn StorageBackend>,
    core_types: BTreeSet<String>,
    columns: Mutex<LruCache<String, HashSet<String>>>,
    retry_delay: Duration,
    shutdown: Shutdown,
}

impl ModerationContext {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        core_types: BTreeSet<String>,
        retry_delay: Duration,
        shutdown: Shutdown,
    ) -> Self {
        let capacity = NonZeroUsize::new(COLUMN_CACHE_TABLES).unwrap_or(NonZeroUsize::MIN);
        Self {
            storage,
            core_types,
            columns: Mutex::new(LruCache::new(capacity)),
            retry_delay,
            shutdown,
        }
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn is_core_type(&self, entity_type: &str) -> bool {
        self.core_types.contains(entity_type)
    }

    /// Run a storage call, re-entering it after the retry delay while the
    /// backend is unreachable.
    pub fn call<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&dyn StorageBackend) -> Result<T>,
    ) -> Result<T> {
        let storage = self.storage.as_ref();
        with_fixed_delay(&self.shutdown, self.retry_delay, RetryPolicy::Unbounded, what, || {
            op(storage)
        })
    }

    /// Columns of `table`, from cache when possible.
    pub fn known_columns(&self, table: &str) -> Result<HashSet<String>> {
        if let Some(columns) = self.columns.lock().get(table) {
            return Ok(columns.clone());
        }
        let columns: HashSet<String> = self
            .call("read columns", |storage| storage.columns(table))?
            .into_iter()
            .collect();
        self.columns.lock().put(table.to_string(), columns.clone());
        Ok(columns)
    }

    /// Add whichever of `wanted` the table lacks. Returns the columns added.
    pub fn ensure_columns<'a>(
        &self,
        table: &str,
        wanted: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>> {
        let known = self.known_columns(table)?;
        let missing: Vec<String> = wanted
            .into_iter()
            .filter(|column| !known.contains(*column))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for column in &missing {
            if let Err(e) = self.call("add column", |storage| storage.add_column(table, column)) {
                self.forget(table);
                return Err(e);
            }
            debug!(table, column = %column, "Column added");
        }
        if !missing.is_empty() {
            if let Some(columns) = self.columns.lock().get_mut(table) {
                columns.extend(missing.iter().cloned());
            }
        }
        Ok(missing)
    }

    /// Drop `column` from `table` if present. Returns whether it was dropped.
    pub fn drop_column(&self, table: &str, column: &str) -> Result<bool> {
        if !self.known_columns(table)?.contains(column) {
            return Ok(false);
        }
        let result = self.call("drop column", |storage| storage.drop_column(table, column));
        self.forget(table);
        result.map(|()| true)
    }

    /// Invalidate the cached column set of `table`.
    pub fn forget(&self, table: &str) {
        self.columns.lock().pop(table);
    }

    /// Invalidate every cached column set.
    pub fn forget_all(&self) {
        self.columns.lock().clear();
    }
}
