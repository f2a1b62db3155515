//! Search engine contract.

use crate::error::Result;
use serde_json::Value;

/// One entry of a bulk request.
#[derive(Clone, Debug, PartialEq)]
pub enum BulkRequest {
    Index { index: String, id: String, doc: Value },
    Delete { index: String, id: String },
}

pub trait SearchBackend: Send + Sync {
    fn is_reachable(&self) -> bool;

    fn index_exists(&self, index: &str) -> Result<bool>;

    fn create_index(&self, index: &str) -> Result<()>;

    fn delete_index(&self, index: &str) -> Result<()>;

    fn index_document(&self, index: &str, id: &str, doc: &Value) -> Result<()>;

    fn delete_document(&self, index: &str, id: &str) -> Result<()>;

    fn bulk(&self, requests: Vec<BulkRequest>) -> Result<()>;

    /// Copy documents `ids` from `source` into `target`, restricted to
    /// `fields` when given (other target fields are kept). Returns documents copied.
    fn reindex_range(
        &self,
        source: &str,
        target: &str,
        ids: &[String],
        fields: Option<&[String]>,
    ) -> Result<usize>;
}
