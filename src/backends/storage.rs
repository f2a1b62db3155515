//! Keyed entity store contract.

use crate::error::Result;
use serde_json::{Map, Value};
use std::fmt;

/// Column values of one row.
pub type Fields = Map<String, Value>;

/// Columns every entity table is created with.
pub const BASE_COLUMNS: &[&str] = &["id", "language", "row_key", "_ts", "_version", "_created"];

/// Row key: partition id plus clustering components.
///
/// Deleting a key removes every row the key is a prefix of, so
/// `RowKey::partition(id)` removes all rows of an entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub id: String,
    pub clustering: Vec<String>,
}

impl RowKey {
    pub fn new<I, S>(id: impl Into<String>, clustering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            clustering: clustering.into_iter().map(Into::into).collect(),
        }
    }

    pub fn partition(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            clustering: Vec::new(),
        }
    }

    /// Whether `other` falls under this key.
    pub fn covers(&self, other: &RowKey) -> bool {
        self.id == other.id && other.clustering.starts_with(&self.clustering)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        for part in &self.clustering {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

/// Tables kept per managed entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKind {
    Item,
    Reference,
    Subtable,
    Configuration,
    Mapping,
    /// Materialized view over the item table.
    View,
}

impl TableKind {
    pub const ALL: [TableKind; 6] = [
        TableKind::Item,
        TableKind::Reference,
        TableKind::Subtable,
        TableKind::Configuration,
        TableKind::Mapping,
        TableKind::View,
    ];

    fn suffix(self) -> &'static str {
        match self {
            TableKind::Item => "item",
            TableKind::Reference => "reference",
            TableKind::Subtable => "subtable",
            TableKind::Configuration => "configuration",
            TableKind::Mapping => "mapping",
            TableKind::View => "view",
        }
    }
}

/// `{entityType}_{kind}`
pub fn table_name(entity_type: &str, kind: TableKind) -> String {
    format!("{entity_type}_{}", kind.suffix())
}

/// Storage semantics the moderators depend on. No query language is assumed.
pub trait StorageBackend: Send + Sync {
    /// Readiness probe (is the storage host reachable).
    fn is_reachable(&self) -> bool;

    /// Create the keyspace if missing.
    fn create_keyspace(&self) -> Result<()>;

    fn table_exists(&self, table: &str) -> Result<bool>;

    fn create_table(&self, table: &str, columns: &[String]) -> Result<()>;

    fn drop_table(&self, table: &str) -> Result<()>;

    fn index_exists(&self, table: &str, column: &str) -> Result<bool>;

    fn create_index(&self, table: &str, column: &str) -> Result<()>;

    fn create_materialized_view(&self, view: &str, base_table: &str) -> Result<()>;

    fn columns(&self, table: &str) -> Result<Vec<String>>;

    fn add_column(&self, table: &str, column: &str) -> Result<()>;

    fn drop_column(&self, table: &str, column: &str) -> Result<()>;

    fn upsert_row(&self, table: &str, key: &RowKey, fields: &Fields) -> Result<()>;

    /// One batched write of several rows.
    fn upsert_batch(&self, table: &str, rows: &[(RowKey, Fields)]) -> Result<()>;

    /// Delete every row `key` covers. Returns rows removed.
    fn delete_row(&self, table: &str, key: &RowKey) -> Result<usize>;

    fn truncate(&self, table: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_covers() {
        let partition = RowKey::partition("62");
        let row = RowKey::new("62", ["en", "supplier#0"]);
        assert!(partition.covers(&row));
        assert!(RowKey::new("62", ["en"]).covers(&row));
        assert!(!RowKey::new("62", ["de"]).covers(&row));
        assert!(!RowKey::partition("620").covers(&row));
        assert_eq!(row.to_string(), "62/en/supplier#0");
    }

    #[test]
    fn test_table_names() {
        assert_eq!(table_name("Product", TableKind::Item), "Product_item");
        assert_eq!(table_name("Product", TableKind::View), "Product_view");
    }
}
