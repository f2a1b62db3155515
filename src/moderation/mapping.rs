//! Class to attribute mappings.

use super::{ModerationContext, Moderator};
use crate::backends::{table_name, Fields, RowKey, TableKind};
use crate::error::{Result, SyncError};
use crate::fabric::BusMessage;
use crate::types::{Action, MessageKind};
use serde_json::Value;

/// Entity id that empties the mapping table (sent on full resync).
pub const TRUNCATE_SENTINEL: &str = "-1";

/// Appends (or, for deletes, removes) `(classId, attributeId)` pairs.
///
/// The payload is either `{"classId": .., "attributeIds": [..]}` or a list
/// of `{"classId": .., "attributeId": ..}` objects.
pub struct MappingModerator;

impl MappingModerator {
    fn pairs(payload: &Value) -> Result<Vec<(String, String)>> {
        let id = |value: &Value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        let invalid = || SyncError::InvalidMessage(format!("unrecognised mapping payload {payload}"));

        match payload {
            Value::Object(map) => {
                let class_id = map.get("classId").and_then(id).ok_or_else(invalid)?;
                let attributes = map
                    .get("attributeIds")
                    .and_then(Value::as_array)
                    .ok_or_else(invalid)?;
                Ok(attributes
                    .iter()
                    .filter_map(id)
                    .map(|attribute| (class_id.clone(), attribute))
                    .collect())
            }
            Value::Array(entries) => entries
                .iter()
                .map(|entry| {
                    let class_id = entry.get("classId").and_then(id).ok_or_else(invalid)?;
                    let attribute = entry.get("attributeId").and_then(id).ok_or_else(invalid)?;
                    Ok((class_id, attribute))
                })
                .collect(),
            _ => Err(invalid()),
        }
    }
}

impl Moderator for MappingModerator {
    fn kind(&self) -> MessageKind {
        MessageKind::Mapping
    }

    fn apply(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()> {
        let table = table_name(&message.entity_type, TableKind::Mapping);
        if message.entity_id == TRUNCATE_SENTINEL {
            return ctx.call("truncate mappings", |storage| storage.truncate(&table));
        }

        let pairs = Self::pairs(&message.payload)?;
        if message.action == Action::Delete {
            for (class_id, attribute_id) in &pairs {
                let key = RowKey::new(class_id.as_str(), [attribute_id.as_str()]);
                ctx.call("delete mapping", |storage| storage.delete_row(&table, &key))?;
            }
            return Ok(());
        }

        let rows: Vec<(RowKey, Fields)> = pairs
            .into_iter()
            .map(|(class_id, attribute_id)| {
                let mut fields = Fields::new();
                fields.insert("classId".into(), Value::from(class_id.as_str()));
                fields.insert("attributeId".into(), Value::from(attribute_id.as_str()));
                (RowKey::new(class_id, [attribute_id]), fields)
            })
            .collect();
        ctx.call("append mappings", |storage| storage.upsert_batch(&table, &rows))
    }
}
