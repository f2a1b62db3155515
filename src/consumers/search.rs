//! The search indexer.

use crate::backends::{BulkRequest, SearchBackend};
use crate::config::SyncConfig;
use crate::control::{ControlMessage, OperationType};
use crate::error::Result;
use crate::fabric::BusMessage;
use crate::retry::{with_fixed_delay, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::subscriber::{Consumer, Dispatch};
use crate::types::{Action, MessageKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Keeps one document index per entity type, plus a "searchable" projection
/// filled by reindex requests.
pub struct SearchConsumer {
    name: String,
    types: Vec<String>,
    search: Arc<dyn SearchBackend>,
    index_prefix: String,
    reindex_batch_size: usize,
    retry_delay: Duration,
    shutdown: Shutdown,
}

impl SearchConsumer {
    pub const NAME: &'static str = "search";

    pub fn new(config: &SyncConfig, types: Vec<String>, search: Arc<dyn SearchBackend>, shutdown: Shutdown) -> Self {
        Self {
            name: Self::NAME.to_string(),
            types,
            search,
            index_prefix: config.export_db_name.to_lowercase(),
            reindex_batch_size: config.reindex_batch_size.max(1),
            retry_delay: config.retry_delay(),
            shutdown,
        }
    }

    /// `{exportDb}_{entitytype}`
    pub fn index_for(&self, entity_type: &str) -> String {
        format!("{}_{}", self.index_prefix, entity_type.to_lowercase())
    }

    pub fn searchable_index_for(&self, entity_type: &str) -> String {
        format!("{}_searchable", self.index_for(entity_type))
    }

    fn call<T>(&self, what: &str, op: impl FnMut() -> Result<T>) -> Result<T> {
        with_fixed_delay(&self.shutdown, self.retry_delay, RetryPolicy::Unbounded, what, op)
    }

    fn ensure_indices(&self, types: &[String]) -> Result<()> {
        for entity_type in types {
            for index in [self.index_for(entity_type), self.searchable_index_for(entity_type)] {
                if !self.call("index exists", || self.search.index_exists(&index))? {
                    self.call("create index", || self.search.create_index(&index))?;
                    info!(index = %index, "Index created");
                }
            }
        }
        Ok(())
    }

    fn remove_indices(&self, types: &[String]) -> Result<()> {
        for entity_type in types {
            for index in [self.index_for(entity_type), self.searchable_index_for(entity_type)] {
                self.call("delete index", || self.search.delete_index(&index))?;
                info!(index = %index, "Index deleted");
            }
        }
        Ok(())
    }

    fn apply(&self, kind: MessageKind, message: &BusMessage) -> Result<()> {
        let index = self.index_for(&message.entity_type);
        match kind {
            MessageKind::Item => {
                if message.action == Action::Delete {
                    // Row documents of the entity go with it.
                    let requests: Vec<BulkRequest> = [None, Some(MessageKind::Reference), Some(MessageKind::Subtable)]
                        .into_iter()
                        .map(|part| BulkRequest::Delete {
                            index: index.clone(),
                            id: document_id(&message.entity_id, part),
                        })
                        .collect();
                    return self.call("bulk delete", || self.search.bulk(requests.clone()));
                }
                let doc = document(message, message.payload.clone());
                self.call("index document", || {
                    self.search.index_document(&index, &message.entity_id, &doc)
                })
            }
            MessageKind::Reference | MessageKind::Subtable => {
                let id = document_id(&message.entity_id, Some(kind));
                let mut requests = vec![BulkRequest::Delete {
                    index: index.clone(),
                    id: id.clone(),
                }];
                if message.action != Action::Delete {
                    requests.push(BulkRequest::Index {
                        index: index.clone(),
                        id,
                        doc: document(message, json!({ "rows": message.payload })),
                    });
                }
                self.call("bulk rows", || self.search.bulk(requests.clone()))
            }
            // Attribute configuration and mappings have no documents.
            MessageKind::Configuration | MessageKind::Mapping | MessageKind::Operation => Ok(()),
        }
    }

    /// Copy the requested fields of the affected documents into the
    /// searchable projection, `reindex_batch_size` ids at a time.
    fn reindex(&self, operation: &ControlMessage) -> Result<usize> {
        let ids = operation.affected_item_ids.as_deref().unwrap_or_default();
        let Some(entity_type) = operation.item_types.first() else {
            return Ok(0);
        };
        if ids.is_empty() {
            debug!(entity_type = %entity_type, "Nothing to reindex");
            return Ok(0);
        }

        let source = self.index_for(entity_type);
        let target = self.searchable_index_for(entity_type);
        self.ensure_indices(std::slice::from_ref(entity_type))?;

        let fields = operation.searchable_field_ids.as_deref();
        let mut copied = 0;
        for batch in ids.chunks(self.reindex_batch_size) {
            copied += self.call("reindex", || self.search.reindex_range(&source, &target, batch, fields))?;
        }
        info!(entity_type = %entity_type, requested = ids.len(), copied, "Reindex finished");
        Ok(copied)
    }

    fn report<T>(&self, what: &str, result: Result<T>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                error!(subscriber = %self.name, operation = what, error = %e, "Search operation failed");
                false
            }
        }
    }
}

impl Consumer for SearchConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn handled_types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn is_ready(&self) -> bool {
        self.search.is_reachable()
    }

    fn prepare(&self) -> Result<()> {
        for entity_type in &self.types {
            self.search.index_exists(&self.index_for(entity_type))?;
        }
        self.ensure_indices(&self.types)
    }

    fn process_data(&self, kind: MessageKind, message: &BusMessage) -> Dispatch {
        let result = self.apply(kind, message);
        if let Err(e) = &result {
            error!(
                subscriber = %self.name,
                entity_type = %message.entity_type,
                entity_id = %message.entity_id,
                error = %e,
                "Indexing failed"
            );
        }
        Dispatch::of(&result)
    }

    fn process_operation(&self, operation: &ControlMessage) -> bool {
        match operation.operation_type {
            OperationType::Initialize | OperationType::EntityTypeAdded => {
                self.report("create indices", self.ensure_indices(&operation.item_types))
            }
            OperationType::EntityTypeRemoved => {
                self.report("delete indices", self.remove_indices(&operation.item_types))
            }
            OperationType::Reindex => self.report("reindex", self.reindex(operation)),
            OperationType::DebugModeToggle => true,
        }
    }
}

fn document_id(entity_id: &str, part: Option<MessageKind>) -> String {
    match part {
        None => entity_id.to_string(),
        Some(kind) => format!("{entity_id}/{}", kind.as_str().to_lowercase()),
    }
}

fn document(message: &BusMessage, body: Value) -> Value {
    let mut doc = match body {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".into(), other);
            map
        }
    };
    doc.insert("entityId".into(), Value::from(message.entity_id.as_str()));
    doc.insert("entityType".into(), Value::from(message.entity_type.as_str()));
    doc.insert("_ts".into(), Value::from(message.insertion_time.0));
    Value::Object(doc)
}
