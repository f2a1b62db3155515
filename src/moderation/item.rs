//! Primary item rows.

use super::{report, ModerationContext, Moderator, RowsModerator, DEFAULT_LANGUAGE};
use crate::backends::{table_name, Fields, RowKey, TableKind};
use crate::error::Result;
use crate::fabric::BusMessage;
use crate::subscriber::Dispatch;
use crate::types::{Action, MessageKind};
use serde_json::{Map, Value};
use tracing::debug;

/// Payload fields that are not item attributes.
const ENVELOPE_FIELDS: &[&str] = &["variants", "references", "subtables", "version"];

/// Writes an item's language variants, expanding array-valued attributes into
/// extra rows. Core types also rewrite their reference and subtable rows from
/// the same payload.
pub struct ItemModerator {
    references: RowsModerator,
    subtables: RowsModerator,
}

impl Default for ItemModerator {
    fn default() -> Self {
        Self::new()
    }
}

/// System columns stamped on every item row.
struct Stamp<'a> {
    entity_id: &'a str,
    ts: i64,
    version: i64,
    created: bool,
}

impl ItemModerator {
    pub fn new() -> Self {
        Self {
            references: RowsModerator::references(),
            subtables: RowsModerator::subtables(),
        }
    }

    /// Replace the item's rows. Returns rows written.
    fn apply_item(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<usize> {
        let table = table_name(&message.entity_type, TableKind::Item);
        let entity_id = message.entity_id.as_str();
        ctx.call("delete item", |storage| {
            storage.delete_row(&table, &RowKey::partition(entity_id))
        })?;
        if message.action == Action::Delete {
            return Ok(0);
        }

        let stamp = Stamp {
            entity_id,
            ts: message.insertion_time.0,
            version: message
                .payload
                .get("version")
                .and_then(Value::as_i64)
                .unwrap_or(message.insertion_time.0),
            created: message.action.is_create(),
        };

        let mut written = 0;
        for (language, attributes) in variants(&message.payload) {
            let mut rows = Vec::new();
            flatten(&stamp, vec![language], &attributes, &mut rows);
            // One write per language variant.
            ctx.call("write item", |storage| storage.upsert_batch(&table, &rows))?;
            written += rows.len();
        }
        debug!(entity_type = %message.entity_type, entity_id, rows = written, "Item written");
        Ok(written)
    }

    /// Run the item step and, for core types, both row steps. Every step runs
    /// even if an earlier one failed.
    fn steps(&self, ctx: &ModerationContext, message: &BusMessage) -> Vec<(MessageKind, Result<usize>)> {
        let mut results = vec![(MessageKind::Item, self.apply_item(ctx, message))];
        if ctx.is_core_type(&message.entity_type) {
            for rows in [&self.references, &self.subtables] {
                let result = rows.replace(
                    ctx,
                    &message.entity_type,
                    &message.entity_id,
                    rows.rows_in(&message.payload),
                    message.action,
                    message.insertion_time,
                );
                results.push((rows.kind(), result));
            }
        }
        results
    }
}

impl Moderator for ItemModerator {
    fn kind(&self) -> MessageKind {
        MessageKind::Item
    }

    fn apply(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()> {
        for (_, result) in self.steps(ctx, message) {
            result?;
        }
        Ok(())
    }

    fn moderate(&self, ctx: &ModerationContext, message: &BusMessage) -> Dispatch {
        self.steps(ctx, message)
            .into_iter()
            .fold(Dispatch::Applied, |dispatch, (step, result)| {
                report(step, message, &result);
                dispatch.and(Dispatch::of(&result))
            })
    }
}

/// Language variants of an item payload. A payload without `variants` is a
/// single variant in the default language.
fn variants(payload: &Value) -> Vec<(String, Map<String, Value>)> {
    match payload.get("variants") {
        Some(Value::Object(variants)) => variants
            .iter()
            .filter_map(|(language, attributes)| {
                attributes
                    .as_object()
                    .map(|attributes| (language.clone(), attributes.clone()))
            })
            .collect(),
        _ => match payload {
            Value::Object(map) => {
                let attributes = map
                    .iter()
                    .filter(|(name, _)| !ENVELOPE_FIELDS.contains(&name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                vec![(DEFAULT_LANGUAGE.to_string(), attributes)]
            }
            _ => vec![(DEFAULT_LANGUAGE.to_string(), Map::new())],
        },
    }
}

/// Emit the row at `clustering` and one extra row per element of every
/// array-valued attribute, recursing into object elements.
fn flatten(
    stamp: &Stamp<'_>,
    clustering: Vec<String>,
    attributes: &Map<String, Value>,
    out: &mut Vec<(RowKey, Fields)>,
) {
    let mut fields = Fields::new();
    let mut nested = Vec::new();
    for (name, value) in attributes {
        match value {
            Value::Array(elements) => nested.push((name, elements)),
            other => {
                fields.insert(name.clone(), other.clone());
            }
        }
    }

    fields.insert("id".into(), Value::from(stamp.entity_id));
    fields.insert("language".into(), Value::from(clustering[0].clone()));
    fields.insert("row_key".into(), Value::from(clustering[1..].join("/")));
    fields.insert("_ts".into(), Value::from(stamp.ts));
    fields.insert("_version".into(), Value::from(stamp.version));
    fields.insert("_created".into(), Value::from(stamp.created));
    out.push((RowKey::new(stamp.entity_id, clustering.clone()), fields));

    for (name, elements) in nested {
        for (index, element) in elements.iter().enumerate() {
            let mut child = clustering.clone();
            child.push(format!("{name}#{index}"));
            match element {
                Value::Object(inner) => flatten(stamp, child, inner, out),
                scalar => {
                    let mut single = Map::new();
                    single.insert(name.clone(), scalar.clone());
                    flatten(stamp, child, &single, out);
                }
            }
        }
    }
}
