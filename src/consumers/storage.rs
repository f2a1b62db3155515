//! The storage materializer.

use crate::backends::{table_name, StorageBackend, TableKind, BASE_COLUMNS};
use crate::config::SyncConfig;
use crate::control::{ControlMessage, OperationType};
use crate::error::Result;
use crate::fabric::BusMessage;
use crate::moderation::{ModerationContext, ModeratorSet};
use crate::shutdown::Shutdown;
use crate::subscriber::{Consumer, Dispatch};
use crate::types::MessageKind;
use std::sync::Arc;
use tracing::{error, info};

const CONFIGURATION_COLUMNS: &[&str] = &["id", "typeId", "_ts"];
const MAPPING_COLUMNS: &[&str] = &["classId", "attributeId"];
/// Item columns indexed for lookups.
const INDEXED_COLUMNS: &[&str] = &["language"];

/// Applies data messages to the keyed entity store through the moderators.
pub struct StorageConsumer {
    name: String,
    types: Vec<String>,
    storage: Arc<dyn StorageBackend>,
    context: ModerationContext,
    moderators: ModeratorSet,
}

impl StorageConsumer {
    pub const NAME: &'static str = "master";

    pub fn new(config: &SyncConfig, types: Vec<String>, storage: Arc<dyn StorageBackend>, shutdown: Shutdown) -> Self {
        let context = ModerationContext::new(
            Arc::clone(&storage),
            config.core_types.clone(),
            config.retry_delay(),
            shutdown,
        );
        Self {
            name: Self::NAME.to_string(),
            types,
            storage,
            context,
            moderators: ModeratorSet::new(),
        }
    }

    /// Create the keyspace and each type's tables, index and view if missing.
    pub fn bootstrap(&self, types: &[String]) -> Result<()> {
        self.context.call("create keyspace", |storage| storage.create_keyspace())?;
        for entity_type in types {
            for kind in TableKind::ALL {
                let table = table_name(entity_type, kind);
                if self.context.call("table exists", |storage| storage.table_exists(&table))? {
                    continue;
                }
                let columns: &[&str] = match kind {
                    TableKind::Configuration => CONFIGURATION_COLUMNS,
                    TableKind::Mapping => MAPPING_COLUMNS,
                    _ => BASE_COLUMNS,
                };
                let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
                self.context.call("create table", |storage| {
                    if kind == TableKind::View {
                        storage.create_materialized_view(&table, &table_name(entity_type, TableKind::Item))
                    } else {
                        storage.create_table(&table, &columns)
                    }
                })?;
            }

            let item = table_name(entity_type, TableKind::Item);
            for column in INDEXED_COLUMNS {
                if !self.context.call("index exists", |storage| storage.index_exists(&item, column))? {
                    self.context.call("create index", |storage| storage.create_index(&item, column))?;
                }
            }
            info!(entity_type = %entity_type, "Storage schema ready");
        }
        self.context.forget_all();
        Ok(())
    }

    /// Drop every table of the given types.
    pub fn cleanup(&self, types: &[String]) -> Result<()> {
        for entity_type in types {
            // The view goes before the table it reads from.
            for kind in TableKind::ALL.iter().rev() {
                let table = table_name(entity_type, *kind);
                self.context.call("drop table", |storage| storage.drop_table(&table))?;
            }
            info!(entity_type = %entity_type, "Storage tables dropped");
        }
        self.context.forget_all();
        Ok(())
    }

    fn report(&self, what: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(subscriber = %self.name, operation = what, error = %e, "Storage operation failed");
                false
            }
        }
    }
}

impl Consumer for StorageConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn handled_types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn is_ready(&self) -> bool {
        self.storage.is_reachable()
    }

    fn prepare(&self) -> Result<()> {
        self.storage.create_keyspace()?;
        self.bootstrap(&self.types)
    }

    fn process_data(&self, _kind: MessageKind, message: &BusMessage) -> Dispatch {
        self.moderators.moderate(&self.context, message)
    }

    fn process_operation(&self, operation: &ControlMessage) -> bool {
        match operation.operation_type {
            OperationType::Initialize | OperationType::EntityTypeAdded => {
                self.report("bootstrap", self.bootstrap(&operation.item_types))
            }
            OperationType::EntityTypeRemoved => self.report("cleanup", self.cleanup(&operation.item_types)),
            OperationType::DebugModeToggle | OperationType::Reindex => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStorage;

    fn consumer(storage: Arc<MemoryStorage>) -> StorageConsumer {
        let config = SyncConfig {
            retry_delay_ms: 1,
            ..SyncConfig::default()
        };
        StorageConsumer::new(&config, vec!["Product".into()], storage, Shutdown::new())
    }

    #[test]
    fn test_prepare_bootstraps_schema() {
        let storage = Arc::new(MemoryStorage::new());
        let consumer = consumer(storage.clone());
        consumer.prepare().unwrap();
        // Idempotent.
        consumer.prepare().unwrap();

        assert!(storage.keyspace_exists());
        for kind in TableKind::ALL {
            assert!(storage.table_exists(&table_name("Product", kind)).unwrap());
        }
        assert!(storage.index_exists("Product_item", "language").unwrap());
    }

    #[test]
    fn test_removed_type_tables_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let consumer = consumer(storage.clone());
        consumer.prepare().unwrap();

        let removed = ControlMessage::new(OperationType::EntityTypeRemoved, ["Product"]);
        assert!(consumer.process_operation(&removed));
        assert!(!storage.table_exists("Product_item").unwrap());
        assert!(!storage.table_exists("Product_view").unwrap());
    }

    #[test]
    fn test_unreachable_storage_not_ready() {
        let storage = Arc::new(MemoryStorage::new());
        let consumer = consumer(storage.clone());
        assert!(consumer.is_ready());
        storage.set_available(false);
        assert!(!consumer.is_ready());
        assert!(consumer.prepare().is_err());
    }
}
