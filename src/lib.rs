//! # Entity Fan-out
//!
//! Moves entity changes from a durable outbox to independent consumers over a
//! publish/subscribe bus, with per-subscriber idempotency so redelivered or
//! reordered messages never roll state back.
//!
//! ## Core Concepts
//!
//! - **Outbox**: pending change rows with a per-producer completion bitmask
//! - **Producers**: page the outbox and publish, one per consumer class
//! - **Fabric**: one topic, one selector-filtered queue per subscriber
//! - **Subscribers**: validate, dedupe, dispatch, acknowledge or recover
//! - **Moderators**: idempotent writers of items, rows, schema and mappings
//! - **Control plane**: resync, type registration, debug toggle, reindex
//!
//! ## Example
//!
//! ```ignore
//! use entity_fanout::{stock_consumers, Pipeline, Shutdown, SyncConfig};
//!
//! let config = SyncConfig::load("sync.json")?;
//! let shutdown = Shutdown::new();
//! let consumers = stock_consumers(&config, storage, search, &shutdown);
//! let pipeline = Pipeline::start(&config, outbox, broker, consumers, verbosity, shutdown)?;
//!
//! // ... later
//! pipeline.stop()?;
//! ```

pub mod app;
pub mod backends;
pub mod config;
pub mod consumers;
pub mod control;
pub mod error;
pub mod fabric;
pub mod logging;
pub mod moderation;
pub mod outbox;
pub mod producer;
pub mod retry;
pub mod shutdown;
pub mod subscriber;
pub mod tracker;
pub mod types;

// Re-exports
pub use app::{stock_consumers, Pipeline};
pub use backends::{
    BulkRequest, Fields, MemorySearch, MemoryStorage, RowKey, SearchBackend, StorageBackend,
    TableKind,
};
pub use config::{ProducerConfig, SyncConfig, ANY_CORRELATION};
pub use consumers::{SearchConsumer, StorageConsumer};
pub use control::{ControlMessage, ControlPlaneHandler, OperationType, TypeListener};
pub use error::{Result, SyncError};
pub use fabric::{Addressing, Broker, BusMessage, MemoryBroker, QueueSpec, Selector, Session};
pub use logging::{LevelSwitch, StaticVerbosity, Verbosity};
pub use moderation::{Moderator, ModeratorSet, ModerationContext};
pub use outbox::{MemoryOutbox, OutboxStore};
pub use producer::{BatchProducer, ProducerLoop};
pub use retry::{with_fixed_delay, RetryPolicy};
pub use shutdown::Shutdown;
pub use subscriber::{Consumer, Dispatch, EntityTypeRegistry, Outcome, RuntimeState, RuntimeStats, SubscriberRuntime};
pub use tracker::IdempotencyTracker;
pub use types::*;
