//! Messages as they travel over the bus.

use crate::error::{Result, SyncError};
use crate::types::{Action, MessageKind, Priority, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HEADER_ENTITY_ID: &str = "entityId";
pub const HEADER_ENTITY_TYPE: &str = "entityType";
pub const HEADER_KIND: &str = "messageKind";
pub const HEADER_ACTION: &str = "action";
pub const HEADER_JOB_ID: &str = "jobId";
pub const HEADER_INSERTION_TIME: &str = "insertionTime";
pub const HEADER_INITIAL_LOAD: &str = "initialLoad";

/// Broker-level message: correlation, priority, string headers and a body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub message_id: String,
    pub correlation_id: String,
    pub priority: u8,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Decoded data or control message. Immutable once sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub kind: MessageKind,
    pub action: Action,
    pub job_id: String,
    pub insertion_time: Timestamp,
    pub priority: u8,
    /// Set when the change is part of a bulk catch-up load.
    pub initial_load: bool,
    pub correlation_id: String,
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn priority_level(&self) -> Priority {
        Priority::from_jms(self.priority)
    }

    /// Encode into broker headers and a JSON body.
    pub fn to_wire(&self) -> Result<WireMessage> {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_ENTITY_ID.to_string(), self.entity_id.clone());
        headers.insert(HEADER_ENTITY_TYPE.to_string(), self.entity_type.clone());
        headers.insert(HEADER_KIND.to_string(), self.kind.as_str().to_string());
        headers.insert(HEADER_ACTION.to_string(), self.action.code().to_string());
        headers.insert(HEADER_JOB_ID.to_string(), self.job_id.clone());
        headers.insert(
            HEADER_INSERTION_TIME.to_string(),
            self.insertion_time.0.to_string(),
        );
        headers.insert(
            HEADER_INITIAL_LOAD.to_string(),
            self.initial_load.to_string(),
        );

        Ok(WireMessage {
            message_id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            priority: self.priority,
            headers,
            body: serde_json::to_vec(&self.payload)?,
        })
    }

    /// Decode envelope fields and body. Missing or malformed headers are
    /// `InvalidMessage` errors.
    pub fn decode(wire: &WireMessage) -> Result<Self> {
        let insertion_time = required(wire, HEADER_INSERTION_TIME)?
            .parse::<i64>()
            .map_err(|e| SyncError::InvalidMessage(format!("bad {HEADER_INSERTION_TIME}: {e}")))?;

        let payload = if wire.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&wire.body)
                .map_err(|e| SyncError::InvalidMessage(format!("bad body: {e}")))?
        };

        Ok(Self {
            id: wire.message_id.clone(),
            entity_id: required(wire, HEADER_ENTITY_ID)?.to_string(),
            entity_type: required(wire, HEADER_ENTITY_TYPE)?.to_string(),
            kind: required(wire, HEADER_KIND)?.parse()?,
            action: required(wire, HEADER_ACTION)?.parse()?,
            job_id: wire.header(HEADER_JOB_ID).unwrap_or_default().to_string(),
            insertion_time: Timestamp(insertion_time),
            priority: wire.priority,
            initial_load: wire.header(HEADER_INITIAL_LOAD) == Some("true"),
            correlation_id: wire.correlation_id.clone(),
            payload,
        })
    }
}

fn required<'a>(wire: &'a WireMessage, name: &str) -> Result<&'a str> {
    wire.header(name)
        .ok_or_else(|| SyncError::InvalidMessage(format!("missing header {name}")))
}

/// Broker-assigned handle used to acknowledge one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTag(pub u64);

/// A message handed to a session, awaiting acknowledgement.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: WireMessage,
    /// True if the broker delivered this message before.
    pub redelivered: bool,
}

/// How a subscriber's queue is declared.
#[derive(Clone, Debug)]
pub struct QueueSpec {
    pub name: String,
    pub topic: String,
    pub selector: super::Selector,
    /// Durable queues keep messages across sessions and use client acknowledgement.
    pub durable: bool,
    /// Max unacknowledged deliveries.
    pub prefetch: usize,
}
