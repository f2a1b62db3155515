//! Reference and subtable rows.

use super::{ModerationContext, Moderator, DEFAULT_LANGUAGE};
use crate::backends::{table_name, Fields, RowKey, TableKind};
use crate::error::{Result, SyncError};
use crate::fabric::BusMessage;
use crate::types::{Action, MessageKind, Timestamp};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Replaces the full row set of an entity id in the reference or subtable table.
///
/// Rows are grouped by (language, natural row key) so several payload entries
/// for the same row collapse into one, then written in a single batch after
/// the id's old rows are deleted.
pub struct RowsModerator {
    kind: MessageKind,
    table: TableKind,
    payload_field: &'static str,
    natural_key: fn(&Map<String, Value>, usize) -> String,
}

impl RowsModerator {
    pub fn references() -> Self {
        Self {
            kind: MessageKind::Reference,
            table: TableKind::Reference,
            payload_field: "references",
            natural_key: |row, index| {
                let attribute = text(row, "attribute").unwrap_or_default();
                let target = text(row, "targetId").unwrap_or_else(|| index.to_string());
                format!("{attribute}:{target}")
            },
        }
    }

    pub fn subtables() -> Self {
        Self {
            kind: MessageKind::Subtable,
            table: TableKind::Subtable,
            payload_field: "subtables",
            natural_key: |row, index| {
                let attribute = text(row, "attribute").unwrap_or_default();
                let key = text(row, "rowKey").unwrap_or_else(|| index.to_string());
                format!("{attribute}:{key}")
            },
        }
    }

    /// Rows carried by `payload`: either a bare array or the kind's field of
    /// an object (item payloads nest them this way).
    pub fn rows_in<'a>(&self, payload: &'a Value) -> &'a [Value] {
        match payload {
            Value::Array(rows) => rows,
            Value::Object(map) => match map.get(self.payload_field) {
                Some(Value::Array(rows)) => rows,
                _ => &[],
            },
            _ => &[],
        }
    }

    /// Delete the id's rows, then write `rows` as one batch. Returns rows written.
    pub fn replace(
        &self,
        ctx: &ModerationContext,
        entity_type: &str,
        entity_id: &str,
        rows: &[Value],
        action: Action,
        insertion_time: Timestamp,
    ) -> Result<usize> {
        let table = table_name(entity_type, self.table);
        ctx.call("delete rows", |storage| {
            storage.delete_row(&table, &RowKey::partition(entity_id))
        })?;
        if action == Action::Delete || rows.is_empty() {
            return Ok(0);
        }

        let mut grouped: BTreeMap<(String, String), Fields> = BTreeMap::new();
        for (index, row) in rows.iter().enumerate() {
            let Value::Object(fields) = row else {
                return Err(SyncError::InvalidMessage(format!(
                    "{} row {index} of {entity_id} is not an object",
                    self.kind
                )));
            };
            let language = text(fields, "language").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
            let row_key = (self.natural_key)(fields, index);

            let merged = grouped.entry((language.clone(), row_key.clone())).or_default();
            for (name, value) in fields {
                merged.insert(name.clone(), value.clone());
            }
            merged.insert("id".into(), Value::from(entity_id));
            merged.insert("language".into(), Value::from(language));
            merged.insert("row_key".into(), Value::from(row_key));
            merged.insert("_ts".into(), Value::from(insertion_time.0));
        }

        let batch: Vec<(RowKey, Fields)> = grouped
            .into_iter()
            .map(|((language, row_key), fields)| (RowKey::new(entity_id, [language, row_key]), fields))
            .collect();
        ctx.call("write rows", |storage| storage.upsert_batch(&table, &batch))?;
        Ok(batch.len())
    }
}

impl Moderator for RowsModerator {
    fn kind(&self) -> MessageKind {
        self.kind
    }

    fn apply(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()> {
        self.replace(
            ctx,
            &message.entity_type,
            &message.entity_id,
            self.rows_in(&message.payload),
            message.action,
            message.insertion_time,
        )
        .map(|_| ())
    }
}

/// String or number field rendered as text.
fn text(row: &Map<String, Value>, name: &str) -> Option<String> {
    match row.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
