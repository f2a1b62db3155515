//! Core types shared by the producer and subscriber sides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SyncError;

/// Primary key of an outbox row (assigned by the outbox, insertion ordered).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch. Staging insertion times use this unit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change action carried by an outbox row and its bus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    /// Part of a bulk catch-up load.
    InitialLoad,
}

impl Action {
    /// Single-letter wire code.
    pub fn code(self) -> &'static str {
        match self {
            Action::Create => "C",
            Action::Update => "U",
            Action::Delete => "D",
            Action::InitialLoad => "I",
        }
    }

    /// Whether the action creates the entity (initial loads do too).
    pub fn is_create(self) -> bool {
        matches!(self, Action::Create | Action::InitialLoad)
    }
}

impl FromStr for Action {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "C" => Ok(Action::Create),
            "U" => Ok(Action::Update),
            "D" => Ok(Action::Delete),
            "I" => Ok(Action::InitialLoad),
            other => Err(SyncError::InvalidMessage(format!("unknown action code {other:?}"))),
        }
    }
}

/// What a bus message describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Item,
    Reference,
    Subtable,
    Configuration,
    Mapping,
    /// Control-plane message, never data.
    Operation,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Item => "Item",
            MessageKind::Reference => "Reference",
            MessageKind::Subtable => "Subtable",
            MessageKind::Configuration => "Configuration",
            MessageKind::Mapping => "Mapping",
            MessageKind::Operation => "Operation",
        }
    }

    /// Kinds that describe a row of a managed entity instance.
    pub fn is_entity_row(self) -> bool {
        matches!(
            self,
            MessageKind::Item | MessageKind::Reference | MessageKind::Subtable
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Item" => Ok(MessageKind::Item),
            "Reference" => Ok(MessageKind::Reference),
            "Subtable" => Ok(MessageKind::Subtable),
            "Configuration" => Ok(MessageKind::Configuration),
            "Mapping" => Ok(MessageKind::Mapping),
            "Operation" => Ok(MessageKind::Operation),
            other => Err(SyncError::InvalidMessage(format!("unknown message kind {other:?}"))),
        }
    }
}

/// Broker priority levels (JMS scale 0-9, higher delivered first).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    FileContent,
    InitialLoad,
    Delta,
    Configuration,
}

impl Priority {
    pub fn jms(self) -> u8 {
        match self {
            Priority::FileContent => 1,
            Priority::InitialLoad => 3,
            Priority::Delta => 4,
            Priority::Configuration => 7,
        }
    }

    /// Nearest level for a raw JMS priority.
    pub fn from_jms(value: u8) -> Self {
        match value {
            0..=1 => Priority::FileContent,
            2..=3 => Priority::InitialLoad,
            4..=5 => Priority::Delta,
            _ => Priority::Configuration,
        }
    }
}

/// A single producer's flag in an outbox row's completion bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerBit(pub u32);

/// Completion bitmask: which producers have already sent a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ProducerMask(pub u32);

impl ProducerMask {
    pub fn contains(self, bit: ProducerBit) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn with(self, bit: ProducerBit) -> Self {
        ProducerMask(self.0 | bit.0)
    }

    /// True once every bit in `full` is set.
    pub fn is_complete(self, full: ProducerMask) -> bool {
        self.0 & full.0 == full.0
    }
}

impl FromIterator<ProducerBit> for ProducerMask {
    fn from_iter<I: IntoIterator<Item = ProducerBit>>(iter: I) -> Self {
        iter.into_iter().fold(ProducerMask(0), ProducerMask::with)
    }
}

/// Payload encoding of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PayloadEncoding {
    #[default]
    Json,
    MessagePack,
}

/// A pending change row in the outbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Assigned by the outbox.
    pub row_id: RowId,
    pub entity_id: String,
    pub entity_type: String,
    pub kind: MessageKind,
    pub action: Action,
    /// Opaque serialized change.
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
    pub insertion_time: Timestamp,
    /// Raw JMS priority.
    pub priority: u8,
    pub producer_status: ProducerMask,
}

/// Input for staging a new outbox row (before a row id is assigned).
#[derive(Clone, Debug)]
pub struct OutboxInput {
    pub entity_id: String,
    pub entity_type: String,
    pub kind: MessageKind,
    pub action: Action,
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
    pub insertion_time: Timestamp,
    pub priority: u8,
}

impl OutboxInput {
    /// Stage a change with a JSON payload.
    pub fn json(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: MessageKind,
        action: Action,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            entity_type,
            entity_id,
            kind,
            action,
            serde_json::to_vec(payload)?,
            PayloadEncoding::Json,
        ))
    }

    /// Stage a change with a MessagePack payload.
    pub fn msgpack(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: MessageKind,
        action: Action,
        payload: &impl Serialize,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self::new(
            entity_type,
            entity_id,
            kind,
            action,
            rmp_serde::to_vec_named(payload)?,
            PayloadEncoding::MessagePack,
        ))
    }

    fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: MessageKind,
        action: Action,
        payload: Vec<u8>,
        encoding: PayloadEncoding,
    ) -> Self {
        let priority = match (kind, action) {
            (MessageKind::Configuration | MessageKind::Mapping, _) => Priority::Configuration,
            (_, Action::InitialLoad) => Priority::InitialLoad,
            _ => Priority::Delta,
        };
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            kind,
            action,
            payload,
            encoding,
            insertion_time: Timestamp::now(),
            priority: priority.jms(),
        }
    }

    pub fn at(mut self, insertion_time: Timestamp) -> Self {
        self.insertion_time = insertion_time;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Which subscriber instance is responsible for which entity type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTypeRegistration {
    pub subscriber: String,
    pub entity_type: String,
    pub is_custom: bool,
}

/// Topic scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Core,
    Project,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Core => "core",
            Scope::Project => "project",
        }
    }
}
