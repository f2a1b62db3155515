//! Operation messages: type registration, debug toggle, targeting.

use entity_fanout::{
    Action, Addressing, Broker, BusMessage, Consumer, ControlMessage, EntityTypeRegistry,
    IdempotencyTracker, MemoryBroker, MemoryStorage, MessageKind, OperationType, Outcome,
    Priority, Session, Shutdown, StaticVerbosity, StorageBackend, StorageConsumer,
    SubscriberRuntime, SyncConfig, Timestamp, Verbosity,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    config: SyncConfig,
    broker: MemoryBroker,
    storage: Arc<MemoryStorage>,
    verbosity: Arc<StaticVerbosity>,
    runtime: SubscriberRuntime,
    session: Box<dyn Session>,
}

impl Harness {
    fn new() -> Self {
        let config = SyncConfig {
            export_db_name: "PIM".into(),
            retry_delay_ms: 1,
            entity_types: vec!["Product".into()],
            core_types: BTreeSet::from(["Product".to_string(), "Part".to_string(), "Product_Variant".to_string()]),
            ..SyncConfig::default()
        };
        let broker = MemoryBroker::new();
        let storage = Arc::new(MemoryStorage::new());
        let verbosity = Arc::new(StaticVerbosity::new(false));
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
            verbosity.clone(),
            shutdown,
        );
        let session = runtime.start().unwrap();
        Self {
            config,
            broker,
            storage,
            verbosity,
            runtime,
            session,
        }
    }

    fn send(&self, message: BusMessage) {
        let topic = Addressing::from_config(&self.config).topic();
        self.broker.publish(&topic, message.to_wire().unwrap()).unwrap();
    }

    fn next(&mut self) -> Outcome {
        let delivery = self
            .session
            .receive(Duration::from_millis(200))
            .unwrap()
            .expect("delivery");
        self.runtime.process(self.session.as_mut(), delivery)
    }

    fn selector_handles(&self, entity_type: &str) -> bool {
        self.broker
            .selector_of(self.runtime.queue_name())
            .is_some_and(|selector| selector.handles(entity_type))
    }
}

fn operation(control: ControlMessage, time: i64) -> BusMessage {
    BusMessage {
        id: format!("op-{time}"),
        entity_id: format!("op-{time}"),
        entity_type: "Operation".into(),
        kind: MessageKind::Operation,
        action: Action::Create,
        job_id: "job".into(),
        insertion_time: Timestamp(time),
        priority: Priority::Configuration.jms(),
        initial_load: false,
        correlation_id: "any".into(),
        payload: control.to_value().unwrap(),
    }
}

fn part(time: i64, payload: Value) -> BusMessage {
    item("Part", "9", time, payload)
}

fn item(entity_type: &str, entity_id: &str, time: i64, payload: Value) -> BusMessage {
    BusMessage {
        id: format!("{entity_type}-{entity_id}-{time}"),
        entity_id: entity_id.into(),
        entity_type: entity_type.into(),
        kind: MessageKind::Item,
        action: Action::Create,
        job_id: "job".into(),
        insertion_time: Timestamp(time),
        priority: Priority::Delta.jms(),
        initial_load: false,
        correlation_id: "master".into(),
        payload,
    }
}

#[test]
fn test_added_type_is_bootstrapped_and_selected() {
    let mut harness = Harness::new();
    assert!(!harness.selector_handles("Part"));

    // Not selected yet: never reaches the queue.
    harness.send(part(1, json!({ "name": "early" })));
    assert_eq!(harness.broker.depth(harness.runtime.queue_name()), 0);

    harness.send(operation(ControlMessage::new(OperationType::EntityTypeAdded, ["Part"]), 2));
    assert_eq!(harness.next(), Outcome::Applied);
    assert!(harness.storage.table_exists("Part_item").unwrap());
    assert!(harness.runtime.registry().handles("master", "Part"));
    assert!(harness.selector_handles("Part"));

    harness.send(part(3, json!({ "name": "Washer" })));
    assert_eq!(harness.next(), Outcome::Applied);
    assert_eq!(harness.storage.row_count("Part_item"), 1);
    assert_eq!(harness.runtime.tracker().get("Part_9"), Some(3));
}

#[test]
fn test_removed_type_is_dropped_and_purged() {
    let mut harness = Harness::new();
    harness.send(operation(ControlMessage::new(OperationType::EntityTypeAdded, ["Part"]), 1));
    assert_eq!(harness.next(), Outcome::Applied);
    harness.send(part(2, json!({ "name": "Washer" })));
    assert_eq!(harness.next(), Outcome::Applied);

    // Queued behind the removal, which outranks it.
    harness.send(part(3, json!({ "name": "Late" })));
    harness.send(operation(ControlMessage::new(OperationType::EntityTypeRemoved, ["Part"]), 4));
    assert_eq!(harness.next(), Outcome::Applied);

    assert!(!harness.storage.table_exists("Part_item").unwrap());
    assert!(!harness.runtime.registry().handles("master", "Part"));
    assert!(!harness.selector_handles("Part"));
    assert!(harness.selector_handles("Product"));
    assert_eq!(harness.broker.depth(harness.runtime.queue_name()), 0);
    assert_eq!(harness.runtime.tracker().get("Part_9"), None);
}

#[test]
fn test_removal_keeps_types_extending_the_name() {
    let mut harness = Harness::new();
    harness.send(operation(ControlMessage::new(OperationType::EntityTypeAdded, ["Product_Variant"]), 1));
    assert_eq!(harness.next(), Outcome::Applied);

    harness.send(item("Product", "1", 2, json!({ "name": "Bolt" })));
    assert_eq!(harness.next(), Outcome::Applied);
    harness.send(item("Product_Variant", "5", 3, json!({ "name": "Long bolt" })));
    assert_eq!(harness.next(), Outcome::Applied);

    harness.send(operation(ControlMessage::new(OperationType::EntityTypeRemoved, ["Product"]), 4));
    assert_eq!(harness.next(), Outcome::Applied);

    assert_eq!(harness.runtime.tracker().get("Product_1"), None);
    assert_eq!(harness.runtime.tracker().get("Product_Variant_5"), Some(3));
    assert!(harness.runtime.registry().handles("master", "Product_Variant"));
    assert!(harness.storage.table_exists("Product_Variant_item").unwrap());
}

#[test]
fn test_debug_toggle() {
    let mut harness = Harness::new();
    assert!(!harness.verbosity.is_debug());

    harness.send(operation(ControlMessage::new(OperationType::DebugModeToggle, Vec::<String>::new()), 1));
    assert_eq!(harness.next(), Outcome::Applied);
    assert!(harness.verbosity.is_debug());

    let mut explicit = ControlMessage::new(OperationType::DebugModeToggle, Vec::<String>::new());
    explicit.enabled = Some(true);
    harness.send(operation(explicit, 2));
    assert_eq!(harness.next(), Outcome::Applied);
    assert!(harness.verbosity.is_debug());

    harness.send(operation(ControlMessage::new(OperationType::DebugModeToggle, Vec::<String>::new()), 3));
    assert_eq!(harness.next(), Outcome::Applied);
    assert!(!harness.verbosity.is_debug());
}

#[test]
fn test_operation_for_other_target_is_ignored() {
    let mut harness = Harness::new();
    let removal = ControlMessage::new(OperationType::EntityTypeRemoved, ["Product"]).for_target("search");
    harness.send(operation(removal, 1));

    assert_eq!(harness.next(), Outcome::Applied);
    assert!(harness.storage.table_exists("Product_item").unwrap());
    assert!(harness.runtime.registry().handles("master", "Product"));
}

#[test]
fn test_unreadable_operation_is_acknowledged() {
    let mut harness = Harness::new();
    let mut broken = operation(ControlMessage::new(OperationType::Initialize, Vec::<String>::new()), 1);
    broken.payload = json!({ "operationType": "Explode" });
    harness.send(broken);

    assert_eq!(harness.next(), Outcome::Applied);
    assert_eq!(harness.broker.depth(harness.runtime.queue_name()), 0);
}
