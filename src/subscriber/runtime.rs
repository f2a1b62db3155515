//! Consumption state machine shared by every consumer variant.

use super::{Consumer, Dispatch, EntityTypeRegistry};
use crate::config::SyncConfig;
use crate::control::{ControlPlaneHandler, TypeListener};
use crate::error::Result;
use crate::fabric::{correlation_matches, Addressing, Broker, BusMessage, Delivery, QueueSpec, Selector, Session};
use crate::logging::Verbosity;
use crate::retry::{with_fixed_delay, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::tracker::IdempotencyTracker;
use crate::types::{Action, MessageKind};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Ready,
    Receiving,
    Validating,
    Dispatching,
    Acknowledging,
    Recovering,
    Stopped,
}

/// What happened to one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Acknowledged without processing (wrong correlation, unsupported type, malformed).
    Rejected,
    /// Older than what the tracker has seen.
    Stale,
    /// Dispatch failed; the session was recovered for redelivery.
    Recovered,
    /// Dispatch failed on a non-durable subscriber; acknowledged anyway.
    Dropped,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Rejected => "rejected",
            Outcome::Stale => "stale",
            Outcome::Recovered => "recovering",
            Outcome::Dropped => "dropped",
        }
    }
}

/// Counters since start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub applied: u64,
    pub rejected: u64,
    pub stale: u64,
    pub recovered: u64,
    pub dropped: u64,
    /// Applied messages that were part of a bulk catch-up.
    pub initial_load: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    recovered: AtomicU64,
    dropped: AtomicU64,
    initial_load: AtomicU64,
}

impl Counters {
    fn count(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Applied => &self.applied,
            Outcome::Rejected => &self.rejected,
            Outcome::Stale => &self.stale,
            Outcome::Recovered => &self.recovered,
            Outcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs one consumer against its queue: readiness gating, decoding,
/// filtering, staleness checks, dispatch and acknowledge-or-recover.
pub struct SubscriberRuntime {
    consumer: Arc<dyn Consumer>,
    broker: Arc<dyn Broker>,
    tracker: Arc<IdempotencyTracker>,
    registry: Arc<EntityTypeRegistry>,
    control: ControlPlaneHandler,
    queue: String,
    topic: String,
    core_types: BTreeSet<String>,
    workflow_type: String,
    prefetch: usize,
    connect_attempts: u32,
    receive_timeout: Duration,
    retry_delay: Duration,
    checkpoint_interval: Duration,
    shutdown: Shutdown,
    state: Mutex<RuntimeState>,
    counters: Counters,
}

impl SubscriberRuntime {
    /// Runtime whose tracker and registry live under `config.checkpoint_dir`.
    pub fn open(
        config: &SyncConfig,
        consumer: Arc<dyn Consumer>,
        broker: Arc<dyn Broker>,
        verbosity: Arc<dyn Verbosity>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let identity = Addressing::from_config(config).subscriber_identity(consumer.name());
        let tracker = Arc::new(IdempotencyTracker::open(&config.checkpoint_dir, &identity)?);
        let registry = Arc::new(EntityTypeRegistry::open(&config.checkpoint_dir, &identity)?);
        Ok(Self::with_parts(config, consumer, broker, tracker, registry, verbosity, shutdown))
    }

    pub fn with_parts(
        config: &SyncConfig,
        consumer: Arc<dyn Consumer>,
        broker: Arc<dyn Broker>,
        tracker: Arc<IdempotencyTracker>,
        registry: Arc<EntityTypeRegistry>,
        verbosity: Arc<dyn Verbosity>,
        shutdown: Shutdown,
    ) -> Self {
        let addressing = Addressing::from_config(config);
        let queue = addressing.queue_for(consumer.name());
        let control = ControlPlaneHandler::new(
            consumer.name(),
            queue.clone(),
            Arc::clone(&broker),
            Arc::clone(&tracker),
            Arc::clone(&registry),
            verbosity,
        );
        Self {
            consumer,
            broker,
            tracker,
            registry,
            control,
            queue,
            topic: addressing.topic(),
            core_types: config.core_types.clone(),
            workflow_type: config.workflow_type.clone(),
            prefetch: config.prefetch,
            connect_attempts: config.connect_attempts,
            receive_timeout: config.receive_timeout(),
            retry_delay: config.retry_delay(),
            checkpoint_interval: config.checkpoint_interval(),
            shutdown,
            state: Mutex::new(RuntimeState::Idle),
            counters: Counters::default(),
        }
    }

    /// Report entity types added or removed by operations to `listener`.
    pub fn with_type_listener(mut self, listener: Arc<dyn TypeListener>) -> Self {
        self.control.set_listener(listener);
        self
    }

    pub fn name(&self) -> &str {
        self.consumer.name()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock()
    }

    pub fn tracker(&self) -> &Arc<IdempotencyTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<EntityTypeRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            initial_load: self.counters.initial_load.load(Ordering::Relaxed),
        }
    }

    fn enter(&self, state: RuntimeState) {
        *self.state.lock() = state;
    }

    /// Connect, prepare the consumer, register its types and open the queue.
    ///
    /// The connection is retried `connect_attempts` times; any failure here
    /// is fatal for the subscriber.
    pub fn start(&self) -> Result<Box<dyn Session>> {
        let attempts = RetryPolicy::Attempts(self.connect_attempts.max(1));
        with_fixed_delay(&self.shutdown, self.retry_delay, attempts, "broker connect", || {
            self.broker.connect()
        })?;
        self.consumer.prepare()?;

        let name = self.consumer.name();
        if self.registry.types_for(name).is_empty() {
            self.registry
                .register(name, self.consumer.handled_types(), self.consumer.is_custom())?;
        }

        let spec = QueueSpec {
            name: self.queue.clone(),
            topic: self.topic.clone(),
            selector: Selector::for_types(self.registry.types_for(name)),
            durable: self.consumer.is_durable(),
            prefetch: self.prefetch,
        };
        let session = with_fixed_delay(&self.shutdown, self.retry_delay, attempts, "subscribe", || {
            self.broker.subscribe(spec.clone())
        })?;

        self.enter(RuntimeState::Ready);
        info!(
            subscriber = name,
            queue = %self.queue,
            durable = self.consumer.is_durable(),
            types = ?self.registry.types_for(name),
            "Subscriber ready"
        );
        Ok(session)
    }

    /// Start, consume until shutdown, then drain.
    pub fn run(&self) -> Result<()> {
        let session = self.start()?;
        self.serve(session)
    }

    /// Consume from a session opened by `start` until shutdown, then drain.
    pub fn serve(&self, mut session: Box<dyn Session>) -> Result<()> {
        let result = self.consume(session.as_mut());
        let drained = self.drain(session);
        result.and(drained)
    }

    fn consume(&self, session: &mut dyn Session) -> Result<()> {
        let mut last_flush = Instant::now();
        while !self.shutdown.is_cancelled() {
            if !self.consumer.is_ready() {
                self.enter(RuntimeState::Recovering);
                warn!(subscriber = self.name(), "Subscriber recovering: destination not ready");
                if let Err(e) = session.recover() {
                    warn!(subscriber = self.name(), error = %e, "Session recover failed");
                }
                self.shutdown.sleep(self.retry_delay);
                continue;
            }

            self.enter(RuntimeState::Receiving);
            match session.receive(self.receive_timeout) {
                Ok(Some(delivery)) => {
                    self.process(session, delivery);
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(subscriber = self.name(), error = %e, "Receive failed, retrying");
                    self.shutdown.sleep(self.retry_delay);
                }
                Err(e) => {
                    error!(subscriber = self.name(), error = %e, "Receive failed");
                    return Err(e);
                }
            }
            self.enter(RuntimeState::Ready);

            if last_flush.elapsed() >= self.checkpoint_interval {
                if let Err(e) = self.tracker.flush_if_dirty() {
                    warn!(subscriber = self.name(), error = %e, "Periodic checkpoint flush failed");
                }
                last_flush = Instant::now();
            }
        }
        Ok(())
    }

    /// Take one delivery through validation, dispatch and acknowledgement.
    pub fn process(&self, session: &mut dyn Session, delivery: Delivery) -> Outcome {
        let started = Instant::now();
        let message = match BusMessage::decode(&delivery.message) {
            Ok(message) => message,
            Err(e) => {
                info!(subscriber = self.name(), message_id = %delivery.message.message_id, error = %e, "Malformed message rejected");
                self.acknowledge(session, &delivery);
                self.counters.count(Outcome::Rejected);
                return Outcome::Rejected;
            }
        };

        let outcome = self.validate_and_dispatch(session, &delivery, &message);
        self.counters.count(outcome);
        if message.initial_load && outcome == Outcome::Applied {
            self.counters.initial_load.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            subscriber = self.name(),
            entity_type = %message.entity_type,
            entity_id = %message.entity_id,
            kind = %message.kind,
            action = message.action.code(),
            job_id = %message.job_id,
            initial_load = message.initial_load,
            redelivered = delivery.redelivered,
            outcome = outcome.as_str(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Message processed"
        );
        outcome
    }

    fn validate_and_dispatch(&self, session: &mut dyn Session, delivery: &Delivery, message: &BusMessage) -> Outcome {
        if let Some(reason) = self.rejection(message) {
            info!(subscriber = self.name(), entity_type = %message.entity_type, entity_id = %message.entity_id, reason, "Message rejected");
            self.acknowledge(session, delivery);
            return Outcome::Rejected;
        }

        let dispatch = if message.kind == MessageKind::Operation {
            self.enter(RuntimeState::Dispatching);
            if self.control.handle(message, self.consumer.as_ref(), session) {
                Dispatch::Applied
            } else {
                Dispatch::Retry
            }
        } else {
            self.enter(RuntimeState::Validating);
            if self.is_tracked(message) {
                let key = IdempotencyTracker::key(&message.entity_type, message.kind, &message.entity_id);
                if !self.tracker.observe(&key, message.insertion_time, message.action) {
                    debug!(subscriber = self.name(), key = %key, insertion_time = %message.insertion_time, "Stale message dropped");
                    self.acknowledge(session, delivery);
                    return Outcome::Stale;
                }
            }
            self.enter(RuntimeState::Dispatching);
            self.consumer.process_data(message.kind, message)
        };

        if dispatch == Dispatch::Applied {
            self.acknowledge(session, delivery);
            Outcome::Applied
        } else if dispatch == Dispatch::Rejected {
            info!(
                subscriber = self.name(),
                entity_type = %message.entity_type,
                entity_id = %message.entity_id,
                kind = %message.kind,
                "Unusable payload acknowledged without applying"
            );
            self.acknowledge(session, delivery);
            Outcome::Rejected
        } else if !self.consumer.is_durable() {
            self.acknowledge(session, delivery);
            Outcome::Dropped
        } else {
            self.enter(RuntimeState::Recovering);
            warn!(
                subscriber = self.name(),
                entity_type = %message.entity_type,
                entity_id = %message.entity_id,
                kind = %message.kind,
                "Subscriber recovering: dispatch failed, requesting redelivery"
            );
            if let Err(e) = session.recover() {
                error!(subscriber = self.name(), error = %e, "Session recover failed");
            }
            self.shutdown.sleep(self.retry_delay);
            Outcome::Recovered
        }
    }

    /// Why `message` is acknowledged without processing, if it is.
    fn rejection(&self, message: &BusMessage) -> Option<&'static str> {
        if !correlation_matches(&message.correlation_id, self.name()) {
            return Some("correlation mismatch");
        }
        if message.kind == MessageKind::Operation {
            return None;
        }
        if !self.registry.handles(self.name(), &message.entity_type) {
            return Some("unsupported entity type");
        }
        if message.entity_type == self.workflow_type && message.action != Action::Delete {
            return Some("workflow change is not a delete");
        }
        None
    }

    fn is_tracked(&self, message: &BusMessage) -> bool {
        message.kind.is_entity_row() && self.core_types.contains(&message.entity_type)
    }

    fn acknowledge(&self, session: &mut dyn Session, delivery: &Delivery) {
        self.enter(RuntimeState::Acknowledging);
        if let Err(e) = session.acknowledge(delivery.tag) {
            error!(subscriber = self.name(), tag = delivery.tag.0, error = %e, "Acknowledge failed");
        }
    }

    /// Stop intake, flush the checkpoint, close the session.
    fn drain(&self, session: Box<dyn Session>) -> Result<()> {
        info!(subscriber = self.name(), "Subscriber draining");
        let flushed = self.tracker.flush();
        if let Err(e) = &flushed {
            error!(subscriber = self.name(), error = %e, "Final checkpoint flush failed");
        }
        let closed = session.close();
        self.enter(RuntimeState::Stopped);
        info!(subscriber = self.name(), "Subscriber stopped");
        flushed.and(closed)
    }

    /// Stop the loop from another thread.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
