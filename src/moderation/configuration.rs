//! Attribute configuration rows and the schema changes they imply.

use super::{ModerationContext, Moderator};
use crate::backends::{table_name, Fields, RowKey, TableKind};
use crate::error::Result;
use crate::fabric::BusMessage;
use crate::types::{Action, MessageKind};
use serde_json::Value;
use tracing::info;

/// Attribute classification stored as `typeId`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeType {
    /// Folder or class node; owns no column.
    Folder = 0,
    Leaf = 1,
    Reference = 2,
    Subtable = 3,
}

impl AttributeType {
    /// Classify from the payload flags `isFolder`/`isClass`, `isReference`
    /// and `isSubtable`.
    pub fn classify(payload: &Value) -> Self {
        let flag = |name: &str| payload.get(name).and_then(Value::as_bool).unwrap_or(false);
        if flag("isFolder") || flag("isClass") {
            AttributeType::Folder
        } else if flag("isReference") {
            AttributeType::Reference
        } else if flag("isSubtable") {
            AttributeType::Subtable
        } else {
            AttributeType::Leaf
        }
    }

    pub fn type_id(self) -> i64 {
        self as i64
    }
}

/// Upserts the configuration row for an attribute and keeps the entity
/// tables' dynamic columns in line with it.
///
/// A leaf attribute owns a column named after its id in the item table;
/// reference and subtable attributes own the columns listed in their
/// `attributes` payload field in the matching row table. Deleting the
/// configuration drops those columns again.
pub struct ConfigurationModerator;

impl ConfigurationModerator {
    fn owned_columns(message: &BusMessage) -> Vec<String> {
        match AttributeType::classify(&message.payload) {
            AttributeType::Folder => Vec::new(),
            AttributeType::Leaf => vec![message.entity_id.clone()],
            AttributeType::Reference | AttributeType::Subtable => sub_attributes(&message.payload),
        }
    }

    fn upsert(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()> {
        let entity_type = &message.entity_type;
        let attribute_type = AttributeType::classify(&message.payload);

        let target = match attribute_type {
            AttributeType::Folder => None,
            AttributeType::Leaf => Some(TableKind::Item),
            AttributeType::Reference => Some(TableKind::Reference),
            AttributeType::Subtable => Some(TableKind::Subtable),
        };
        if let Some(kind) = target {
            let table = table_name(entity_type, kind);
            let columns = Self::owned_columns(message);
            let added = ctx.ensure_columns(&table, columns.iter().map(String::as_str))?;
            if !added.is_empty() {
                info!(table = %table, columns = ?added, "Dynamic columns created");
            }
        }

        let mut fields = Fields::new();
        if let Value::Object(payload) = &message.payload {
            for (name, value) in payload {
                if !value.is_array() && !value.is_object() {
                    fields.insert(name.clone(), value.clone());
                }
            }
        }
        fields.insert("id".into(), Value::from(message.entity_id.as_str()));
        fields.insert("typeId".into(), Value::from(attribute_type.type_id()));
        fields.insert("_ts".into(), Value::from(message.insertion_time.0));

        let table = table_name(entity_type, TableKind::Configuration);
        ctx.ensure_columns(&table, fields.keys().map(String::as_str))?;
        ctx.call("write configuration", |storage| {
            storage.upsert_row(&table, &RowKey::partition(message.entity_id.as_str()), &fields)
        })
    }

    fn remove(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()> {
        let entity_type = &message.entity_type;
        let table = table_name(entity_type, TableKind::Configuration);
        ctx.call("delete configuration", |storage| {
            storage.delete_row(&table, &RowKey::partition(message.entity_id.as_str()))
        })?;

        let columns = Self::owned_columns(message);
        for kind in [TableKind::Item, TableKind::Reference, TableKind::Subtable, TableKind::View] {
            let table = table_name(entity_type, kind);
            for column in &columns {
                if ctx.drop_column(&table, column)? {
                    info!(table = %table, column = %column, "Dynamic column dropped");
                }
            }
        }
        Ok(())
    }
}

impl Moderator for ConfigurationModerator {
    fn kind(&self) -> MessageKind {
        MessageKind::Configuration
    }

    fn apply(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()> {
        match message.action {
            Action::Delete => self.remove(ctx, message),
            _ => self.upsert(ctx, message),
        }
    }
}

fn sub_attributes(payload: &Value) -> Vec<String> {
    payload
        .get("attributes")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
