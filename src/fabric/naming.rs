//! Topic, queue and correlation naming.

use crate::config::{SyncConfig, ANY_CORRELATION};
use crate::types::Scope;

/// Naming conventions for one export database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Addressing {
    pub scope: Scope,
    pub export_db_name: String,
    pub queue_prefix: String,
}

impl Addressing {
    pub fn new(scope: Scope, export_db_name: impl Into<String>, queue_prefix: impl Into<String>) -> Self {
        Self {
            scope,
            export_db_name: export_db_name.into(),
            queue_prefix: queue_prefix.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.scope, &config.export_db_name, &config.queue_prefix)
    }

    /// `{scope}VirtualTopic.{exportDbName}`
    pub fn topic(&self) -> String {
        format!("{}VirtualTopic.{}", self.scope.as_str(), self.export_db_name)
    }

    /// `{prefix}{subscriberName}_{exportDbName}.{topicName}`
    pub fn queue_for(&self, subscriber: &str) -> String {
        format!(
            "{}{}_{}.{}",
            self.queue_prefix,
            subscriber,
            self.export_db_name,
            self.topic()
        )
    }

    /// Checkpoint / marker file stem for a subscriber.
    pub fn subscriber_identity(&self, subscriber: &str) -> String {
        format!("{}_{}", subscriber, self.export_db_name)
    }
}

/// Whether a message's correlation id addresses `subscriber`.
pub fn correlation_matches(correlation_id: &str, subscriber: &str) -> bool {
    correlation_id == ANY_CORRELATION || correlation_id == subscriber
}
