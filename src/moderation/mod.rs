//! Moderators apply one decoded message kind to the storage backend.
//!
//! Every moderator is safe to re-apply: rows are deleted and rewritten per
//! entity id, so a redelivered message converges to the same state. Failures
//! never propagate past a moderator; they are logged with the entity id and
//! reported as a `Dispatch`. Malformed payloads are rejected, storage
//! failures make the subscriber ask for redelivery.
//!
//! Item payloads look like:
//!
//! ```json
//! {
//!   "version": 3,
//!   "variants": { "en": { "name": "Bolt", "colors": ["red", "blue"] } },
//!   "references": [ { "attribute": "supplier", "targetId": "77", "language": "en" } ],
//!   "subtables": [ { "attribute": "dimensions", "rowKey": "0", "width": 3 } ]
//! }
//! ```

mod configuration;
mod context;
mod item;
mod mapping;
mod rows;

pub use configuration::{AttributeType, ConfigurationModerator};
pub use context::ModerationContext;
pub use item::ItemModerator;
pub use mapping::{MappingModerator, TRUNCATE_SENTINEL};
pub use rows::RowsModerator;

use crate::error::Result;
use crate::fabric::BusMessage;
use crate::subscriber::Dispatch;
use crate::types::MessageKind;
use tracing::{error, info};

/// Language used for rows whose payload carries no variant.
pub const DEFAULT_LANGUAGE: &str = "default";

pub trait Moderator: Send + Sync {
    fn kind(&self) -> MessageKind;

    /// Apply `message`, propagating the first storage error.
    fn apply(&self, ctx: &ModerationContext, message: &BusMessage) -> Result<()>;

    /// Apply and classify the result, logging any failure.
    fn moderate(&self, ctx: &ModerationContext, message: &BusMessage) -> Dispatch {
        let result = self.apply(ctx, message);
        report(self.kind(), message, &result);
        Dispatch::of(&result)
    }
}

fn report<T>(step: MessageKind, message: &BusMessage, result: &Result<T>) {
    let Err(e) = result else {
        return;
    };
    if Dispatch::of(result) == Dispatch::Rejected {
        info!(
            kind = %step,
            entity_type = %message.entity_type,
            entity_id = %message.entity_id,
            error = %e,
            "Malformed payload rejected"
        );
    } else {
        error!(
            kind = %step,
            entity_type = %message.entity_type,
            entity_id = %message.entity_id,
            error = %e,
            "Moderation failed"
        );
    }
}

/// One moderator per data kind.
pub struct ModeratorSet {
    item: ItemModerator,
    reference: RowsModerator,
    subtable: RowsModerator,
    configuration: ConfigurationModerator,
    mapping: MappingModerator,
}

impl Default for ModeratorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeratorSet {
    pub fn new() -> Self {
        Self {
            item: ItemModerator::new(),
            reference: RowsModerator::references(),
            subtable: RowsModerator::subtables(),
            configuration: ConfigurationModerator,
            mapping: MappingModerator,
        }
    }

    /// The moderator for `kind`; operations have none.
    pub fn for_kind(&self, kind: MessageKind) -> Option<&dyn Moderator> {
        match kind {
            MessageKind::Item => Some(&self.item),
            MessageKind::Reference => Some(&self.reference),
            MessageKind::Subtable => Some(&self.subtable),
            MessageKind::Configuration => Some(&self.configuration),
            MessageKind::Mapping => Some(&self.mapping),
            MessageKind::Operation => None,
        }
    }

    /// Route `message` to its moderator. Kinds without one are rejected.
    pub fn moderate(&self, ctx: &ModerationContext, message: &BusMessage) -> Dispatch {
        match self.for_kind(message.kind) {
            Some(moderator) => moderator.moderate(ctx, message),
            None => {
                error!(kind = %message.kind, entity_id = %message.entity_id, "No moderator for message kind");
                Dispatch::Rejected
            }
        }
    }
}
