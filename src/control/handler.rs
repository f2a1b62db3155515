//! Execution of control-plane operations for one subscriber.

use super::{ControlMessage, OperationType};
use crate::config::ANY_CORRELATION;
use crate::error::Result;
use crate::fabric::{Broker, BusMessage, Selector, Session, WireMessage, HEADER_ENTITY_TYPE, HEADER_KIND};
use crate::logging::Verbosity;
use crate::subscriber::{Consumer, EntityTypeRegistry};
use crate::tracker::IdempotencyTracker;
use crate::types::MessageKind;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Told when a subscriber's control plane changes the entity types it manages.
pub trait TypeListener: Send + Sync {
    fn types_added(&self, subscriber: &str, entity_types: &[String]);

    fn types_removed(&self, subscriber: &str, entity_types: &[String]);
}

/// Interprets operation messages: resync, entity type membership, log level
/// and reindex requests.
///
/// Returns `true` when the message may be acknowledged. A `false` makes the
/// runtime recover the session so the operation is redelivered.
pub struct ControlPlaneHandler {
    subscriber: String,
    queue: String,
    broker: Arc<dyn Broker>,
    tracker: Arc<IdempotencyTracker>,
    registry: Arc<EntityTypeRegistry>,
    verbosity: Arc<dyn Verbosity>,
    listener: Option<Arc<dyn TypeListener>>,
}

impl ControlPlaneHandler {
    pub fn new(
        subscriber: impl Into<String>,
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        tracker: Arc<IdempotencyTracker>,
        registry: Arc<EntityTypeRegistry>,
        verbosity: Arc<dyn Verbosity>,
    ) -> Self {
        Self {
            subscriber: subscriber.into(),
            queue: queue.into(),
            broker,
            tracker,
            registry,
            verbosity,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn TypeListener>) {
        self.listener = Some(listener);
    }

    pub fn handle(&self, message: &BusMessage, consumer: &dyn Consumer, session: &mut dyn Session) -> bool {
        let operation = match ControlMessage::from_message(message) {
            Ok(operation) => operation,
            Err(e) => {
                info!(subscriber = %self.subscriber, message_id = %message.id, error = %e, "Unreadable operation dropped");
                return true;
            }
        };
        if let Some(target) = &operation.target {
            if target != ANY_CORRELATION && *target != self.subscriber {
                debug!(subscriber = %self.subscriber, target = %target, "Operation for another subscriber");
                return true;
            }
        }

        let kind = operation.operation_type;
        let result = match kind {
            OperationType::Initialize => self.initialize(message, &operation, consumer),
            OperationType::EntityTypeAdded => self.add_types(&operation, consumer, session),
            OperationType::EntityTypeRemoved => self.remove_types(&operation, consumer, session),
            OperationType::DebugModeToggle => self.toggle_debug(&operation),
            OperationType::Reindex => Ok(consumer.process_operation(&operation)),
        };

        match result {
            Ok(done) => {
                info!(subscriber = %self.subscriber, operation = %kind, types = ?operation.item_types, success = done, "Operation handled");
                done
            }
            Err(e) => {
                error!(subscriber = %self.subscriber, operation = %kind, error = %e, "Operation failed");
                false
            }
        }
    }

    /// Clear the tracker once per epoch, bootstrap storage, reload the checkpoint.
    fn initialize(&self, message: &BusMessage, operation: &ControlMessage, consumer: &dyn Consumer) -> Result<bool> {
        if !consumer.handles_initial_load() {
            debug!(subscriber = %self.subscriber, "Resync not handled by this subscriber");
            return Ok(true);
        }
        if !consumer.is_ready() {
            warn!(subscriber = %self.subscriber, "Not ready for resync");
            return Ok(false);
        }

        let mut bootstrap = operation.clone();
        if bootstrap.item_types.is_empty() {
            bootstrap.item_types = self.registry.types_for(&self.subscriber).into_iter().collect();
        }

        // The epoch is the staging time of this Initialize; every instance
        // sees the same one.
        self.tracker.clear_for_epoch(message.insertion_time.0)?;
        if !consumer.process_operation(&bootstrap) {
            return Ok(false);
        }
        self.tracker.reload()?;
        Ok(true)
    }

    fn add_types(&self, operation: &ControlMessage, consumer: &dyn Consumer, session: &mut dyn Session) -> Result<bool> {
        let new: Vec<String> = operation
            .item_types
            .iter()
            .filter(|t| !self.registry.handles(&self.subscriber, t))
            .cloned()
            .collect();
        if new.is_empty() {
            self.notify_added(&operation.item_types);
            return Ok(true);
        }

        if consumer.handles_initial_load() {
            let bootstrap = ControlMessage::new(OperationType::Initialize, new.iter().cloned());
            if !consumer.process_operation(&bootstrap) {
                return Ok(false);
            }
        }

        self.registry.register(&self.subscriber, new.iter().cloned(), consumer.is_custom())?;
        let managed = self.registry.types_for(&self.subscriber);
        session.set_selector(Selector::for_types(managed.iter().cloned()))?;
        for entity_type in &new {
            self.tracker.purge_type(entity_type, managed.iter().map(String::as_str));
        }
        self.notify_added(&operation.item_types);
        Ok(true)
    }

    fn remove_types(&self, operation: &ControlMessage, consumer: &dyn Consumer, session: &mut dyn Session) -> Result<bool> {
        let removed: BTreeSet<String> = operation
            .item_types
            .iter()
            .filter(|t| self.registry.handles(&self.subscriber, t))
            .cloned()
            .collect();
        if removed.is_empty() {
            self.notify_removed(&operation.item_types);
            return Ok(true);
        }

        let cleanup = ControlMessage {
            item_types: removed.iter().cloned().collect(),
            ..operation.clone()
        };
        if !consumer.process_operation(&cleanup) {
            return Ok(false);
        }

        self.registry.unregister(&self.subscriber, removed.iter().cloned())?;
        let managed = self.registry.types_for(&self.subscriber);
        session.set_selector(Selector::for_types(managed.iter().cloned()))?;

        let only_removed = |wire: &WireMessage| {
            wire.header(HEADER_KIND) != Some(MessageKind::Operation.as_str())
                && wire
                    .header(HEADER_ENTITY_TYPE)
                    .is_some_and(|t| removed.contains(t))
        };
        match self.broker.purge(&self.queue, &only_removed) {
            Ok(purged) => debug!(queue = %self.queue, purged, "Queued messages of removed types purged"),
            Err(e) => warn!(queue = %self.queue, error = %e, "Purge of removed types failed"),
        }

        for entity_type in &removed {
            let others = managed.iter().chain(&removed).map(String::as_str);
            self.tracker.purge_type(entity_type, others);
        }
        self.notify_removed(&operation.item_types);
        Ok(true)
    }

    fn notify_added(&self, entity_types: &[String]) {
        if let Some(listener) = &self.listener {
            listener.types_added(&self.subscriber, entity_types);
        }
    }

    fn notify_removed(&self, entity_types: &[String]) {
        if let Some(listener) = &self.listener {
            listener.types_removed(&self.subscriber, entity_types);
        }
    }

    fn toggle_debug(&self, operation: &ControlMessage) -> Result<bool> {
        let enabled = operation.enabled.unwrap_or(!self.verbosity.is_debug());
        self.verbosity.set_debug(enabled)?;
        info!(subscriber = %self.subscriber, debug = enabled, "Log verbosity switched");
        Ok(true)
    }
}
