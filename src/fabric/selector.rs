//! Queue selectors by entity type.

use super::types::{WireMessage, HEADER_ENTITY_TYPE, HEADER_KIND};
use crate::types::MessageKind;
use std::collections::BTreeSet;

/// Disjunction over handled entity types, always OR'd with the Operation kind
/// so control messages reach every subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    entity_types: BTreeSet<String>,
}

impl Selector {
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn entity_types(&self) -> &BTreeSet<String> {
        &self.entity_types
    }

    pub fn handles(&self, entity_type: &str) -> bool {
        self.entity_types.contains(entity_type)
    }

    pub fn matches(&self, message: &WireMessage) -> bool {
        if message.header(HEADER_KIND) == Some(MessageKind::Operation.as_str()) {
            return true;
        }
        message
            .header(HEADER_ENTITY_TYPE)
            .is_some_and(|entity_type| self.handles(entity_type))
    }

    /// Broker selector expression.
    pub fn expression(&self) -> String {
        self.entity_types
            .iter()
            .map(|t| format!("{HEADER_ENTITY_TYPE} = '{}'", t.replace('\'', "''")))
            .chain(std::iter::once(format!(
                "{HEADER_KIND} = '{}'",
                MessageKind::Operation.as_str()
            )))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}
