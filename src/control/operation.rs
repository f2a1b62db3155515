//! Control message wire shape.

use crate::error::{Result, SyncError};
use crate::fabric::BusMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Full resync: clear the tracker once per epoch and bootstrap storage.
    Initialize,
    EntityTypeAdded,
    EntityTypeRemoved,
    DebugModeToggle,
    /// Push selected fields of selected documents into the searchable projection.
    Reindex,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Body of an `Operation` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub operation_type: OperationType,
    #[serde(default)]
    pub item_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_item_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable_field_ids: Option<Vec<String>>,
    /// Consumer class the operation is for; absent means every class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Explicit level for `DebugModeToggle`; absent flips the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ControlMessage {
    pub fn new<I, S>(operation_type: OperationType, item_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operation_type,
            item_types: item_types.into_iter().map(Into::into).collect(),
            affected_item_ids: None,
            searchable_field_ids: None,
            target: None,
            enabled: None,
        }
    }

    pub fn reindex<I, S>(item_type: impl Into<String>, ids: I, fields: Option<Vec<String>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            affected_item_ids: Some(ids.into_iter().map(Into::into).collect()),
            searchable_field_ids: fields,
            ..Self::new(OperationType::Reindex, [item_type.into()])
        }
    }

    pub fn for_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Parse the payload of an operation message.
    pub fn from_message(message: &BusMessage) -> Result<Self> {
        serde_json::from_value(message.payload.clone())
            .map_err(|e| SyncError::InvalidMessage(format!("bad control message: {e}")))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
