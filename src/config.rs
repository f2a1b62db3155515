//! Pipeline configuration.

use crate::error::{Result, SyncError};
use crate::types::{ProducerBit, ProducerMask, Scope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Subscriber name that addresses every consumer class.
pub const ANY_CORRELATION: &str = "any";

/// One producer per consumer class; its bit marks rows it has sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Producer name (used in logs).
    pub name: String,
    /// Completion bit in the outbox bitmask.
    pub bit: u32,
    /// Correlation id stamped on data messages (the consumer class it feeds).
    pub target: String,
}

impl ProducerConfig {
    pub fn new(name: impl Into<String>, bit: u32, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bit,
            target: target.into(),
        }
    }

    pub fn producer_bit(&self) -> ProducerBit {
        ProducerBit(self.bit)
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Export database the topics are named after.
    pub export_db_name: String,

    pub scope: Scope,

    /// Prefix of durable subscriber queues.
    pub queue_prefix: String,

    /// Directory for tracker checkpoints, epoch markers and registrations.
    pub checkpoint_dir: PathBuf,

    /// Outbox rows selected per page.
    /// Default: 500
    pub batch_size: usize,

    /// Broker storage usage (percent) at which producers stop sending.
    /// Default: 80
    pub storage_threshold_percent: u8,

    pub poll_interval_ms: u64,

    /// Fixed delay between retries of transient failures.
    pub retry_delay_ms: u64,

    /// Attempts for the initial broker connection before giving up.
    /// Default: 10
    pub connect_attempts: u32,

    pub checkpoint_interval_ms: u64,

    pub receive_timeout_ms: u64,

    /// Max unacknowledged deliveries per durable queue.
    /// Default: 100
    pub prefetch: usize,

    /// Managed entity types: polled by every producer, handled by the stock consumers.
    pub entity_types: Vec<String>,

    /// Entity types whose item updates cascade to reference/subtable rows.
    pub core_types: BTreeSet<String>,

    /// Entity type whose messages are only processed when deleting.
    pub workflow_type: String,

    pub producers: Vec<ProducerConfig>,

    /// Ids pushed per reindex batch.
    pub reindex_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            export_db_name: "export".to_string(),
            scope: Scope::Core,
            queue_prefix: "Consumer.".to_string(),
            checkpoint_dir: PathBuf::from("./checkpoints"),
            batch_size: 500,
            storage_threshold_percent: 80,
            poll_interval_ms: 1_000,
            retry_delay_ms: 5_000,
            connect_attempts: 10,
            checkpoint_interval_ms: 30_000,
            receive_timeout_ms: 500,
            prefetch: 100,
            entity_types: Vec::new(),
            core_types: BTreeSet::new(),
            workflow_type: "Workflow".to_string(),
            producers: Vec::new(),
            reindex_batch_size: 1_000,
        }
    }
}

impl SyncConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: SyncConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if self.storage_threshold_percent > 100 {
            return Err(SyncError::Config(
                "storage_threshold_percent must be at most 100".into(),
            ));
        }
        let mut seen = 0u32;
        for producer in &self.producers {
            if producer.bit == 0 || !producer.bit.is_power_of_two() {
                return Err(SyncError::Config(format!(
                    "producer {} must own exactly one bit, got {}",
                    producer.name, producer.bit
                )));
            }
            if seen & producer.bit != 0 {
                return Err(SyncError::Config(format!(
                    "producer {} reuses bit {}",
                    producer.name, producer.bit
                )));
            }
            seen |= producer.bit;
        }
        Ok(())
    }

    /// Every registered producer's bit OR'd together.
    pub fn full_producer_mask(&self) -> ProducerMask {
        self.producers.iter().map(ProducerConfig::producer_bit).collect()
    }

    pub fn is_core_type(&self, entity_type: &str) -> bool {
        self.core_types.contains(entity_type)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}
