//! Error handling and edge case tests.

use entity_fanout::{
    Action, Addressing, Broker, BusMessage, Consumer, EntityTypeRegistry, IdempotencyTracker,
    MemoryBroker, MemoryStorage, MessageKind, Outcome, Priority, Session, Shutdown,
    StaticVerbosity, StorageConsumer, SubscriberRuntime, SyncConfig, SyncError, Timestamp,
};
use entity_fanout::fabric::WireMessage;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

fn config() -> SyncConfig {
    SyncConfig {
        export_db_name: "PIM".into(),
        retry_delay_ms: 1,
        connect_attempts: 3,
        entity_types: vec!["Product".into()],
        core_types: BTreeSet::from(["Product".to_string()]),
        ..SyncConfig::default()
    }
}

struct Harness {
    config: SyncConfig,
    broker: MemoryBroker,
    storage: Arc<MemoryStorage>,
    runtime: SubscriberRuntime,
    session: Box<dyn Session>,
}

impl Harness {
    fn new(storage: MemoryStorage) -> Self {
        let config = config();
        let broker = MemoryBroker::new();
        let storage = Arc::new(storage);
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
        let session = runtime.start().unwrap();
        Self {
            config,
            broker,
            storage,
            runtime,
            session,
        }
    }

    fn send(&self, message: BusMessage) {
        self.send_wire(message.to_wire().unwrap());
    }

    fn send_wire(&self, wire: WireMessage) {
        let topic = Addressing::from_config(&self.config).topic();
        self.broker.publish(&topic, wire).unwrap();
    }

    fn next(&mut self) -> Outcome {
        let delivery = self
            .session
            .receive(Duration::from_millis(200))
            .unwrap()
            .expect("delivery");
        self.runtime.process(self.session.as_mut(), delivery)
    }

    fn depth(&self) -> usize {
        self.broker.depth(self.runtime.queue_name())
    }
}

fn message(kind: MessageKind, entity_id: &str, action: Action, time: i64, payload: Value) -> BusMessage {
    let priority = match kind {
        MessageKind::Configuration | MessageKind::Mapping => Priority::Configuration,
        _ => Priority::Delta,
    };
    BusMessage {
        id: format!("{entity_id}-{time}"),
        entity_id: entity_id.into(),
        entity_type: "Product".into(),
        kind,
        action,
        job_id: "job".into(),
        insertion_time: Timestamp(time),
        priority: priority.jms(),
        initial_load: false,
        correlation_id: "master".into(),
        payload,
    }
}

fn item(time: i64) -> BusMessage {
    message(
        MessageKind::Item,
        "62",
        Action::Update,
        time,
        json!({
            "variants": { "en": { "name": "Bolt" } },
            "references": [{ "attribute": "supplier", "targetId": "77" }],
        }),
    )
}

// --- Dispatch failures ---

#[test]
fn test_cascade_failure_is_redelivered() {
    let mut harness = Harness::new(MemoryStorage::new());
    harness.storage.fail_writes_to("Product_reference");

    harness.send(item(10));
    assert_eq!(harness.next(), Outcome::Recovered);
    assert_eq!(harness.depth(), 1);
    // The item step ran even though the reference step failed.
    assert_eq!(harness.storage.row_count("Product_item"), 1);
    assert_eq!(harness.storage.row_count("Product_reference"), 0);

    harness.storage.heal_writes_to("Product_reference");
    assert_eq!(harness.next(), Outcome::Applied);
    assert_eq!(harness.depth(), 0);
    assert_eq!(harness.storage.row_count("Product_item"), 1);
    assert_eq!(harness.storage.row_count("Product_reference"), 1);
}

#[test]
fn test_schema_drift_heals_after_configuration() {
    let mut harness = Harness::new(MemoryStorage::strict());
    let plain = message(
        MessageKind::Item,
        "62",
        Action::Create,
        10,
        json!({ "variants": { "en": { "name": "Bolt" } } }),
    );

    harness.send(plain);
    assert_eq!(harness.next(), Outcome::Recovered);
    assert_eq!(harness.storage.row_count("Product_item"), 0);

    // Configuration outranks the redelivered item.
    harness.send(message(
        MessageKind::Configuration,
        "name",
        Action::Create,
        11,
        json!({ "label": "Name", "isFolder": false }),
    ));
    assert_eq!(harness.next(), Outcome::Applied);
    assert!(harness.storage.has_column("Product_item", "name"));

    assert_eq!(harness.next(), Outcome::Applied);
    let rows = harness.storage.rows("Product_item");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1["name"], json!("Bolt"));
}

// --- Rejections ---

#[test]
fn test_correlation_mismatch_is_acknowledged_unapplied() {
    let mut harness = Harness::new(MemoryStorage::new());
    let mut foreign = item(10);
    foreign.correlation_id = "search".into();

    harness.send(foreign);
    assert_eq!(harness.next(), Outcome::Rejected);
    assert_eq!(harness.depth(), 0);
    assert_eq!(harness.storage.row_count("Product_item"), 0);
    assert_eq!(harness.runtime.tracker().get("Product_62"), None);
}

#[test]
fn test_malformed_message_is_acknowledged() {
    let mut harness = Harness::new(MemoryStorage::new());
    let headers = BTreeMap::from([
        ("entityType".to_string(), "Product".to_string()),
        ("messageKind".to_string(), "Item".to_string()),
    ]);
    harness.send_wire(WireMessage {
        message_id: "broken".into(),
        correlation_id: "master".into(),
        priority: 4,
        headers,
        body: b"{not json".to_vec(),
    });

    assert_eq!(harness.next(), Outcome::Rejected);
    assert_eq!(harness.depth(), 0);
    assert_eq!(harness.runtime.stats().rejected, 1);
}

#[test]
fn test_malformed_mapping_payload_is_not_redelivered() {
    let mut harness = Harness::new(MemoryStorage::new());
    harness.send(message(MessageKind::Mapping, "c1", Action::Create, 10, json!("garbage")));

    assert_eq!(harness.next(), Outcome::Rejected);
    assert_eq!(harness.depth(), 0);
    assert_eq!(harness.storage.row_count("Product_mapping"), 0);
    assert_eq!(harness.runtime.stats().recovered, 0);
}

#[test]
fn test_non_object_reference_row_is_not_redelivered() {
    let mut harness = Harness::new(MemoryStorage::new());
    harness.send(message(MessageKind::Reference, "62", Action::Update, 10, json!([42])));

    assert_eq!(harness.next(), Outcome::Rejected);
    assert_eq!(harness.depth(), 0);
    assert_eq!(harness.storage.row_count("Product_reference"), 0);

    // The queue keeps moving.
    harness.send(item(20));
    assert_eq!(harness.next(), Outcome::Applied);
    assert_eq!(harness.storage.row_count("Product_reference"), 1);
}

#[test]
fn test_stale_update_is_dropped() {
    let mut harness = Harness::new(MemoryStorage::new());
    harness.send(item(20));
    harness.send(item(10));

    assert_eq!(harness.next(), Outcome::Applied);
    assert_eq!(harness.next(), Outcome::Stale);
    assert_eq!(harness.runtime.tracker().get("Product_62"), Some(20));
    let rows = harness.storage.rows("Product_item");
    assert_eq!(rows[0].1["_ts"], json!(20));
}

#[test]
fn test_delete_then_late_update_stays_deleted() {
    let mut harness = Harness::new(MemoryStorage::new());
    harness.send(item(10));
    assert_eq!(harness.next(), Outcome::Applied);

    harness.send(message(MessageKind::Item, "62", Action::Delete, 30, Value::Null));
    assert_eq!(harness.next(), Outcome::Applied);
    assert_eq!(harness.storage.row_count("Product_item"), 0);

    harness.send(item(40));
    assert_eq!(harness.next(), Outcome::Stale);
    assert_eq!(harness.storage.row_count("Product_item"), 0);
    assert_eq!(harness.runtime.tracker().get("Product_62"), Some(-1));
}

// --- Startup ---

#[test]
fn test_unreachable_broker_fails_start() {
    let config = config();
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let storage = Arc::new(MemoryStorage::new());
    let consumer: Arc<dyn Consumer> = Arc::new(StorageConsumer::new(
        &config,
        config.entity_types.clone(),
        storage,
        Shutdown::new(),
    ));
    let runtime = SubscriberRuntime::with_parts(
        &config,
        consumer,
        Arc::new(broker),
        Arc::new(IdempotencyTracker::in_memory()),
        Arc::new(EntityTypeRegistry::in_memory()),
        Arc::new(StaticVerbosity::new(false)),
        Shutdown::new(),
    );

    let result = runtime.start();
    assert!(matches!(
        result,
        Err(SyncError::RetriesExhausted { attempts: 3, .. })
    ));
}
