//! Outbox to storage and search, through producers, the bus and subscribers.

use entity_fanout::{
    stock_consumers, Action, BusMessage, Consumer, ControlMessage, Dispatch, EntityTypeRegistry,
    IdempotencyTracker, MemoryBroker, MemoryOutbox, MemorySearch, MemoryStorage, MessageKind,
    OperationType, OutboxInput, Outcome, Pipeline, ProducerConfig, Session, Shutdown,
    StaticVerbosity, StorageBackend, StorageConsumer, SubscriberRuntime, SyncConfig, SyncError,
    Timestamp,
};
use entity_fanout::{Addressing, Broker, Priority};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const STAGED_AT: i64 = 1_000;

fn config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        export_db_name: "PIM".into(),
        checkpoint_dir: dir.path().join("checkpoints"),
        batch_size: 10,
        poll_interval_ms: 10,
        retry_delay_ms: 1,
        receive_timeout_ms: 20,
        checkpoint_interval_ms: 50,
        entity_types: vec!["Product".into()],
        core_types: BTreeSet::from(["Product".to_string()]),
        producers: vec![
            ProducerConfig::new("master-producer", 1, "master"),
            ProducerConfig::new("search-producer", 2, "search"),
        ],
        ..SyncConfig::default()
    }
}

fn reference_rows() -> Value {
    json!([{ "attribute": "supplier", "targetId": "77" }])
}

fn subtable_rows() -> Value {
    json!([{ "attribute": "dimensions", "rowKey": "0", "width": 3 }])
}

fn item_payload() -> Value {
    json!({
        "version": 1,
        "variants": { "en": { "name": "Bolt" } },
        "references": reference_rows(),
        "subtables": subtable_rows(),
    })
}

fn payload_for(kind: MessageKind) -> Value {
    match kind {
        MessageKind::Reference => reference_rows(),
        MessageKind::Subtable => subtable_rows(),
        _ => item_payload(),
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_outbox_reaches_every_consumer() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let outbox = Arc::new(MemoryOutbox::new());
    let broker = MemoryBroker::new();
    let storage = Arc::new(MemoryStorage::new());
    let search = Arc::new(MemorySearch::new());
    let shutdown = Shutdown::new();

    for kind in [MessageKind::Item, MessageKind::Reference, MessageKind::Subtable] {
        let input = OutboxInput::json("Product", "62", kind, Action::Create, &payload_for(kind))
            .unwrap()
            .at(Timestamp(STAGED_AT));
        outbox.insert(input);
    }

    let consumers = stock_consumers(&config, storage.clone(), search.clone(), &shutdown);
    let pipeline = Pipeline::start(
        &config,
        outbox.clone(),
        Arc::new(broker.clone()),
        consumers,
        Arc::new(StaticVerbosity::new(false)),
        shutdown,
    )
    .unwrap();

    let converged = wait_until(Duration::from_secs(5), || {
        outbox.is_empty("Product")
            && storage.row_count("Product_item") == 1
            && storage.row_count("Product_reference") == 1
            && storage.row_count("Product_subtable") == 1
            && search.document_count("pim_product") == 3
    });
    assert!(converged, "pipeline did not converge");

    let runtimes = pipeline.runtimes();
    let master = runtimes.iter().find(|r| r.name() == "master").unwrap();
    assert_eq!(master.tracker().get("Product_62"), Some(STAGED_AT));
    assert_eq!(master.tracker().get("Product_Reference_62"), Some(STAGED_AT));

    pipeline.stop().unwrap();

    // The final flush left the checkpoint on disk.
    let reopened = IdempotencyTracker::open(&config.checkpoint_dir, "master_PIM").unwrap();
    assert_eq!(reopened.get("Product_62"), Some(STAGED_AT));
}

fn stage_operation(outbox: &MemoryOutbox, id: &str, control: ControlMessage) {
    let input = OutboxInput::json("Product", id, MessageKind::Operation, Action::Create, &control.to_value().unwrap())
        .unwrap();
    outbox.insert(input);
}

fn polls(pipeline: &Pipeline, entity_type: &str) -> usize {
    pipeline
        .producing()
        .values()
        .filter(|types| types.iter().any(|t| t == entity_type))
        .count()
}

#[test]
fn test_added_type_is_produced_and_removed_type_is_not() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let outbox = Arc::new(MemoryOutbox::new());
    let storage = Arc::new(MemoryStorage::new());
    let search = Arc::new(MemorySearch::new());
    let shutdown = Shutdown::new();

    // Staged before anyone manages the type.
    let part = OutboxInput::json("Part", "9", MessageKind::Item, Action::Create, &json!({ "name": "Washer" }))
        .unwrap()
        .at(Timestamp(STAGED_AT));
    outbox.insert(part);

    let consumers = stock_consumers(&config, storage.clone(), search.clone(), &shutdown);
    let pipeline = Pipeline::start(
        &config,
        outbox.clone(),
        Arc::new(MemoryBroker::new()),
        consumers,
        Arc::new(StaticVerbosity::new(false)),
        shutdown,
    )
    .unwrap();
    assert_eq!(polls(&pipeline, "Part"), 0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(outbox.len("Part"), 1);

    stage_operation(&outbox, "op-1", ControlMessage::new(OperationType::EntityTypeAdded, ["Part"]));
    let produced = wait_until(Duration::from_secs(5), || {
        outbox.is_empty("Part")
            && storage.row_count("Part_item") == 1
            && search.document_count("pim_part") == 1
    });
    assert!(produced, "added type was not produced");
    assert_eq!(polls(&pipeline, "Part"), 2);

    stage_operation(&outbox, "op-2", ControlMessage::new(OperationType::EntityTypeRemoved, ["Part"]));
    let stopped = wait_until(Duration::from_secs(5), || polls(&pipeline, "Part") == 0);
    assert!(stopped, "removed type is still polled");
    assert!(!storage.table_exists("Part_item").unwrap());
    assert_eq!(polls(&pipeline, "Product"), 2);

    pipeline.stop().unwrap();
}

fn publish(broker: &MemoryBroker, config: &SyncConfig, kind: MessageKind) {
    let message = BusMessage {
        id: format!("62-{kind}"),
        entity_id: "62".into(),
        entity_type: "Product".into(),
        kind,
        action: Action::Create,
        job_id: "job".into(),
        insertion_time: Timestamp(STAGED_AT),
        priority: Priority::Delta.jms(),
        initial_load: false,
        correlation_id: "master".into(),
        payload: payload_for(kind),
    };
    let topic = Addressing::from_config(config).topic();
    broker.publish(&topic, message.to_wire().unwrap()).unwrap();
}

fn drain(runtime: &SubscriberRuntime, session: &mut Box<dyn Session>) {
    while let Some(delivery) = session.receive(Duration::from_millis(50)).unwrap() {
        assert_eq!(runtime.process(session.as_mut(), delivery), Outcome::Applied);
    }
}

#[test]
fn test_any_interleaving_converges() {
    let orders = [
        [MessageKind::Item, MessageKind::Reference, MessageKind::Subtable],
        [MessageKind::Item, MessageKind::Subtable, MessageKind::Reference],
        [MessageKind::Reference, MessageKind::Item, MessageKind::Subtable],
        [MessageKind::Reference, MessageKind::Subtable, MessageKind::Item],
        [MessageKind::Subtable, MessageKind::Item, MessageKind::Reference],
        [MessageKind::Subtable, MessageKind::Reference, MessageKind::Item],
    ];

    for order in orders {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let broker = MemoryBroker::new();
        let storage = Arc::new(MemoryStorage::new());
        let shutdown = Shutdown::new();
        let consumer: Arc<dyn Consumer> = Arc::new(StorageConsumer::new(
            &config,
            config.entity_types.clone(),
            storage.clone(),
            shutdown.clone(),
        ));
        let runtime = SubscriberRuntime::with_parts(
            &config,
            consumer,
            Arc::new(broker.clone()),
            Arc::new(IdempotencyTracker::in_memory()),
            Arc::new(EntityTypeRegistry::in_memory()),
            Arc::new(StaticVerbosity::new(false)),
            shutdown,
        );
        let mut session = runtime.start().unwrap();

        for kind in order {
            publish(&broker, &config, kind);
        }
        drain(&runtime, &mut session);

        assert_eq!(storage.row_count("Product_item"), 1, "order {order:?}");
        assert_eq!(storage.row_count("Product_reference"), 1, "order {order:?}");
        assert_eq!(storage.row_count("Product_subtable"), 1, "order {order:?}");
        assert_eq!(runtime.tracker().get("Product_62"), Some(STAGED_AT));

        let (_, row) = &storage.rows("Product_reference")[0];
        assert_eq!(row["targetId"], json!("77"));
    }
}

#[test]
fn test_start_fails_without_broker() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        connect_attempts: 2,
        ..config(&dir)
    };
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let shutdown = Shutdown::new();
    let consumers = stock_consumers(
        &config,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemorySearch::new()),
        &shutdown,
    );

    let result = Pipeline::start(
        &config,
        Arc::new(MemoryOutbox::new()),
        Arc::new(broker),
        consumers,
        Arc::new(StaticVerbosity::new(false)),
        shutdown.clone(),
    );
    assert!(result.is_err());
    assert!(shutdown.is_cancelled());
}

#[test]
fn test_start_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        batch_size: 0,
        ..config(&dir)
    };
    let shutdown = Shutdown::new();
    let result = Pipeline::start(
        &config,
        Arc::new(MemoryOutbox::new()),
        Arc::new(MemoryBroker::new()),
        Vec::new(),
        Arc::new(StaticVerbosity::new(false)),
        shutdown,
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

/// Passes setup, then crashes on its first readiness check.
struct Crashing;

impl Consumer for Crashing {
    fn name(&self) -> &str {
        "crashing"
    }
    fn handled_types(&self) -> Vec<String> {
        vec!["Product".into()]
    }
    fn is_ready(&self) -> bool {
        panic!("readiness check crashed");
    }
    fn process_data(&self, _kind: MessageKind, _message: &BusMessage) -> Dispatch {
        Dispatch::Applied
    }
    fn process_operation(&self, _operation: &ControlMessage) -> bool {
        true
    }
}

#[test]
fn test_panicked_subscriber_reported_on_stop() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let pipeline = Pipeline::start(
        &config,
        Arc::new(MemoryOutbox::new()),
        Arc::new(MemoryBroker::new()),
        vec![Arc::new(Crashing)],
        Arc::new(StaticVerbosity::new(false)),
        Shutdown::new(),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let result = pipeline.stop();
    assert!(matches!(result, Err(SyncError::WorkerPanicked(ref who)) if who.contains("crashing")));
}
