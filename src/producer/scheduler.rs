//! Scheduling of producer cycles: one thread per (producer, entity type).

use super::BatchProducer;
use crate::error::{Result, SyncError};
use crate::shutdown::Shutdown;
use crossbeam_channel::select;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

struct TypeThread {
    stop: Shutdown,
    handle: JoinHandle<()>,
}

/// The polling threads of one producer. Entity types can be added and
/// removed while it runs.
pub struct ProducerLoop {
    producer: Arc<BatchProducer>,
    interval: Duration,
    shutdown: Shutdown,
    threads: Mutex<BTreeMap<String, TypeThread>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl ProducerLoop {
    /// Start polling every entity type in `entity_types` on its own thread.
    pub fn spawn(
        producer: Arc<BatchProducer>,
        entity_types: &[String],
        interval: Duration,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let running = Self {
            producer,
            interval,
            shutdown,
            threads: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
        };
        for entity_type in entity_types {
            running.add_type(entity_type)?;
        }
        info!(producer = running.producer.name(), threads = entity_types.len(), "Producer loop started");
        Ok(running)
    }

    pub fn producer(&self) -> &BatchProducer {
        &self.producer
    }

    /// Entity types currently polled.
    pub fn entity_types(&self) -> Vec<String> {
        self.threads.lock().keys().cloned().collect()
    }

    /// Start polling `entity_type`. Returns `false` if it already is, or the
    /// loop is shutting down.
    pub fn add_type(&self, entity_type: &str) -> Result<bool> {
        let mut threads = self.threads.lock();
        if threads.contains_key(entity_type) || self.shutdown.is_cancelled() {
            return Ok(false);
        }

        let stop = Shutdown::new();
        let handle = {
            let producer = Arc::clone(&self.producer);
            let shutdown = self.shutdown.clone();
            let stop = stop.clone();
            let entity_type = entity_type.to_string();
            let interval = self.interval;
            thread::Builder::new()
                .name(format!("producer-{}-{entity_type}", producer.name()))
                .spawn(move || Self::poll(&producer, &entity_type, interval, &shutdown, &stop))?
        };
        threads.insert(entity_type.to_string(), TypeThread { stop, handle });
        debug!(producer = self.producer.name(), entity_type, "Producer thread started");
        Ok(true)
    }

    /// Stop polling `entity_type`. The thread finishes its current cycle and
    /// is joined by `join`.
    pub fn remove_type(&self, entity_type: &str) -> bool {
        let Some(thread) = self.threads.lock().remove(entity_type) else {
            return false;
        };
        thread.stop.cancel();
        self.retired.lock().push(thread.handle);
        debug!(producer = self.producer.name(), entity_type, "Producer thread stopped");
        true
    }

    fn poll(producer: &BatchProducer, entity_type: &str, interval: Duration, shutdown: &Shutdown, stop: &Shutdown) {
        while !shutdown.is_cancelled() && !stop.is_cancelled() {
            match producer.run_cycle(entity_type) {
                Ok(sent) => debug!(producer = producer.name(), entity_type, sent, "Tick"),
                Err(SyncError::Cancelled) => break,
                Err(e) => error!(producer = producer.name(), entity_type, error = %e, "Producer cycle failed"),
            }
            let elapsed = select! {
                recv(shutdown.signal()) -> _ => false,
                recv(stop.signal()) -> _ => false,
                default(interval) => true,
            };
            if !elapsed {
                break;
            }
        }
        debug!(producer = producer.name(), entity_type, "Producer thread exiting");
    }

    /// Wait for every producer thread to exit. Call after cancelling.
    pub fn join(self) {
        let running = self.threads.into_inner().into_values().map(|thread| thread.handle);
        for handle in running.chain(self.retired.into_inner()) {
            if handle.join().is_err() {
                error!(producer = self.producer.name(), "Producer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProducerConfig, SyncConfig};
    use crate::fabric::{Addressing, Broker, MemoryBroker, QueueSpec, Selector};
    use crate::outbox::MemoryOutbox;
    use crate::types::{Action, MessageKind, OutboxInput};
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_loop_sends_then_stops_on_cancel() {
        let config = SyncConfig {
            producers: vec![ProducerConfig::new("master-producer", 1, "master")],
            ..SyncConfig::default()
        };
        let addressing = Addressing::from_config(&config);
        let broker = MemoryBroker::new();
        let _session = broker
            .subscribe(QueueSpec {
                name: addressing.queue_for("master"),
                topic: addressing.topic(),
                selector: Selector::for_types(["Asset"]),
                durable: true,
                prefetch: 10,
            })
            .unwrap();

        let outbox = Arc::new(MemoryOutbox::new());
        outbox.insert(
            OutboxInput::json("Asset", "1", MessageKind::Item, Action::Create, &json!({})).unwrap(),
        );

        let shutdown = Shutdown::new();
        let producer = Arc::new(BatchProducer::new(
            &config,
            config.producers[0].clone(),
            outbox.clone(),
            Arc::new(broker.clone()),
            shutdown.clone(),
        ));
        let running = ProducerLoop::spawn(
            producer,
            &["Asset".to_string()],
            Duration::from_millis(5),
            shutdown.clone(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while outbox.len("Asset") > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.cancel();
        running.join();

        assert!(outbox.is_empty("Asset"));
        assert_eq!(broker.depth(&addressing.queue_for("master")), 1);
    }

    #[test]
    fn test_types_added_and_removed_while_running() {
        let config = SyncConfig {
            producers: vec![ProducerConfig::new("master-producer", 1, "master")],
            ..SyncConfig::default()
        };
        let addressing = Addressing::from_config(&config);
        let broker = MemoryBroker::new();
        let _session = broker
            .subscribe(QueueSpec {
                name: addressing.queue_for("master"),
                topic: addressing.topic(),
                selector: Selector::for_types(["Asset", "Part"]),
                durable: true,
                prefetch: 10,
            })
            .unwrap();
        let outbox = Arc::new(MemoryOutbox::new());
        outbox.insert(
            OutboxInput::json("Part", "1", MessageKind::Item, Action::Create, &json!({})).unwrap(),
        );

        let shutdown = Shutdown::new();
        let producer = Arc::new(BatchProducer::new(
            &config,
            config.producers[0].clone(),
            outbox.clone(),
            Arc::new(broker.clone()),
            shutdown.clone(),
        ));
        let running = ProducerLoop::spawn(producer, &["Asset".to_string()], Duration::from_millis(5), shutdown.clone())
            .unwrap();
        assert_eq!(running.producer().target(), "master");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(outbox.len("Part"), 1);

        assert!(running.add_type("Part").unwrap());
        assert!(!running.add_type("Part").unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while outbox.len("Part") > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(outbox.is_empty("Part"));

        assert!(running.remove_type("Part"));
        assert!(!running.remove_type("Part"));
        assert_eq!(running.entity_types(), vec!["Asset".to_string()]);
        thread::sleep(Duration::from_millis(20));

        // Staged after removal: nobody polls it.
        outbox.insert(
            OutboxInput::json("Part", "2", MessageKind::Item, Action::Create, &json!({})).unwrap(),
        );
        thread::sleep(Duration::from_millis(30));
        assert_eq!(outbox.len("Part"), 1);

        shutdown.cancel();
        assert!(!running.add_type("Part").unwrap());
        running.join();
        assert_eq!(broker.depth(&addressing.queue_for("master")), 1);
    }
}
