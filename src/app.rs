//! Composition root: wires producers and subscribers and shuts them down in order.

use crate::backends::{SearchBackend, StorageBackend};
use crate::config::{SyncConfig, ANY_CORRELATION};
use crate::consumers::{SearchConsumer, StorageConsumer};
use crate::control::TypeListener;
use crate::error::{Result, SyncError};
use crate::fabric::Broker;
use crate::logging::Verbosity;
use crate::outbox::OutboxStore;
use crate::producer::{BatchProducer, ProducerLoop};
use crate::shutdown::Shutdown;
use crate::subscriber::{Consumer, SubscriberRuntime};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

/// The stock storage and search consumers for `config.entity_types`.
pub fn stock_consumers(
    config: &SyncConfig,
    storage: Arc<dyn StorageBackend>,
    search: Arc<dyn SearchBackend>,
    shutdown: &Shutdown,
) -> Vec<Arc<dyn Consumer>> {
    vec![
        Arc::new(StorageConsumer::new(config, config.entity_types.clone(), storage, shutdown.clone())),
        Arc::new(SearchConsumer::new(config, config.entity_types.clone(), search, shutdown.clone())),
    ]
}

struct RunningSubscriber {
    runtime: Arc<SubscriberRuntime>,
    handle: JoinHandle<Result<()>>,
}

#[derive(Default)]
struct FleetState {
    /// Entity types each subscriber has its selector open for.
    managed: BTreeMap<String, BTreeSet<String>>,
    loops: Vec<ProducerLoop>,
}

/// Producer loops of every producer class, kept in step with the entity
/// types their target subscriber manages.
///
/// A producer starts polling a type only once its target's selector admits
/// it, so nothing it sends for the type is dropped unbound.
struct ProducerFleet {
    defaults: BTreeSet<String>,
    state: Mutex<FleetState>,
}

impl ProducerFleet {
    fn new(defaults: &[String]) -> Self {
        Self {
            defaults: defaults.iter().cloned().collect(),
            state: Mutex::new(FleetState::default()),
        }
    }

    fn adopt(&self, subscriber: &str, entity_types: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock();
        state
            .managed
            .entry(subscriber.to_string())
            .or_insert_with(|| self.defaults.clone())
            .extend(entity_types);
    }

    fn spawn(&self, producer: Arc<BatchProducer>, interval: Duration, shutdown: Shutdown) -> Result<()> {
        let mut state = self.state.lock();
        let types: Vec<String> = match state.managed.get(producer.target()) {
            Some(types) => types.iter().cloned().collect(),
            None => self.defaults.iter().cloned().collect(),
        };
        let running = ProducerLoop::spawn(producer, &types, interval, shutdown)?;
        state.loops.push(running);
        Ok(())
    }

    fn producing(&self) -> BTreeMap<String, Vec<String>> {
        self.state
            .lock()
            .loops
            .iter()
            .map(|running| (running.producer().name().to_string(), running.entity_types()))
            .collect()
    }

    fn take_loops(&self) -> Vec<ProducerLoop> {
        std::mem::take(&mut self.state.lock().loops)
    }
}

fn feeds(running: &ProducerLoop, subscriber: &str) -> bool {
    let target = running.producer().target();
    target == subscriber || target == ANY_CORRELATION
}

impl TypeListener for ProducerFleet {
    fn types_added(&self, subscriber: &str, entity_types: &[String]) {
        let mut state = self.state.lock();
        state
            .managed
            .entry(subscriber.to_string())
            .or_insert_with(|| self.defaults.clone())
            .extend(entity_types.iter().cloned());

        for running in state.loops.iter().filter(|running| feeds(running, subscriber)) {
            for entity_type in entity_types {
                match running.add_type(entity_type) {
                    Ok(true) => info!(producer = running.producer().name(), entity_type = %entity_type, "Producer now polls added type"),
                    Ok(false) => {}
                    Err(e) => error!(producer = running.producer().name(), entity_type = %entity_type, error = %e, "Producer thread for added type failed to start"),
                }
            }
        }
    }

    fn types_removed(&self, subscriber: &str, entity_types: &[String]) {
        let mut state = self.state.lock();
        if let Some(managed) = state.managed.get_mut(subscriber) {
            for entity_type in entity_types {
                managed.remove(entity_type);
            }
        }

        for running in state.loops.iter().filter(|running| feeds(running, subscriber)) {
            for entity_type in entity_types {
                if running.remove_type(entity_type) {
                    info!(producer = running.producer().name(), entity_type = %entity_type, "Producer stopped polling removed type");
                }
            }
        }
    }
}

/// A running pipeline.
pub struct Pipeline {
    shutdown: Shutdown,
    fleet: Arc<ProducerFleet>,
    subscribers: Vec<RunningSubscriber>,
}

impl Pipeline {
    /// Start every subscriber, then every producer.
    ///
    /// Subscribers open their queues before any producer publishes, so nothing
    /// sent by this pipeline is lost to an unbound topic. Setup failures of a
    /// subscriber (broker unreachable after the connect budget, keyspace
    /// creation) abort the start.
    ///
    /// Entity types added or removed by operations start or stop the
    /// matching producer threads. Types registered by an earlier run keep
    /// theirs.
    pub fn start(
        config: &SyncConfig,
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        consumers: Vec<Arc<dyn Consumer>>,
        verbosity: Arc<dyn Verbosity>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        config.validate()?;
        let fleet = Arc::new(ProducerFleet::new(&config.entity_types));
        let mut pipeline = Self {
            shutdown: shutdown.clone(),
            fleet: Arc::clone(&fleet),
            subscribers: Vec::new(),
        };

        for consumer in consumers {
            let runtime = Arc::new(
                SubscriberRuntime::open(
                    config,
                    consumer,
                    Arc::clone(&broker),
                    Arc::clone(&verbosity),
                    shutdown.clone(),
                )?
                .with_type_listener(fleet.clone()),
            );
            let session = match runtime.start() {
                Ok(session) => session,
                Err(e) => {
                    error!(subscriber = runtime.name(), error = %e, "Subscriber setup failed");
                    pipeline.abort();
                    return Err(e);
                }
            };
            fleet.adopt(runtime.name(), runtime.registry().types_for(runtime.name()));

            let worker = Arc::clone(&runtime);
            let spawned = thread::Builder::new()
                .name(format!("subscriber-{}", runtime.name()))
                .spawn(move || worker.serve(session));
            match spawned {
                Ok(handle) => pipeline.subscribers.push(RunningSubscriber { runtime, handle }),
                Err(e) => {
                    error!(subscriber = runtime.name(), error = %e, "Subscriber thread failed to start");
                    pipeline.abort();
                    return Err(e.into());
                }
            }
        }

        for producer in &config.producers {
            let batch = Arc::new(BatchProducer::new(
                config,
                producer.clone(),
                Arc::clone(&outbox),
                Arc::clone(&broker),
                shutdown.clone(),
            ));
            if let Err(e) = fleet.spawn(batch, config.poll_interval(), shutdown.clone()) {
                error!(producer = %producer.name, error = %e, "Producer failed to start");
                pipeline.abort();
                return Err(e);
            }
        }

        info!(
            subscribers = pipeline.subscribers.len(),
            producers = config.producers.len(),
            types = ?config.entity_types,
            "Pipeline started"
        );
        Ok(pipeline)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn runtimes(&self) -> Vec<Arc<SubscriberRuntime>> {
        self.subscribers.iter().map(|s| Arc::clone(&s.runtime)).collect()
    }

    /// Entity types each producer currently polls, by producer name.
    pub fn producing(&self) -> BTreeMap<String, Vec<String>> {
        self.fleet.producing()
    }

    /// Cancel everything and wait: producers first, then each subscriber
    /// drains (flushes its checkpoint, closes its session). Returns the first
    /// subscriber error.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        for producer in self.fleet.take_loops() {
            producer.join();
        }

        let mut first_error = None;
        for subscriber in self.subscribers.drain(..) {
            if let Err(e) = join_subscriber(subscriber) {
                first_error.get_or_insert(e);
            }
        }
        info!("Pipeline stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn abort(&mut self) {
        self.shutdown.cancel();
        for producer in self.fleet.take_loops() {
            producer.join();
        }
        for subscriber in self.subscribers.drain(..) {
            // Already logged; the setup error is what the caller gets.
            let _ = join_subscriber(subscriber);
        }
    }
}

fn join_subscriber(subscriber: RunningSubscriber) -> Result<()> {
    let name = subscriber.runtime.name().to_string();
    let result = subscriber
        .handle
        .join()
        .unwrap_or_else(|_| Err(SyncError::WorkerPanicked(format!("subscriber {name}"))));
    if let Err(e) = &result {
        error!(subscriber = %name, error = %e, "Subscriber ended with an error");
    }
    result
}
