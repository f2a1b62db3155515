//! Error types for the fan-out pipeline.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Search engine unavailable: {0}")]
    SearchUnavailable(String),

    #[error("Storage rejected write to {table}: {reason}")]
    StorageRejected { table: String, reason: String },

    #[error("Search engine rejected request on {index}: {reason}")]
    SearchRejected { index: String, reason: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checkpoint corrupted at {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
}

impl SyncError {
    /// Connectivity failures that are worth retrying after a fixed delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::BrokerUnavailable(_)
                | SyncError::StorageUnavailable(_)
                | SyncError::SearchUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, SyncError>;
