//! Message fabric: addressing conventions over a broker.
//!
//! - One virtual topic per export database and scope
//! - One queue per subscriber, bound to the topic through a selector over
//!   the entity types it handles (control messages always pass)
//! - Priorities interleave configuration, live deltas and bulk catch-up
//! - Correlation ids route each message to the consumer class it targets
//!
//! # Example
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let addressing = Addressing::new(Scope::Core, "pim", "Consumer.");
//!
//! let mut session = broker.subscribe(QueueSpec {
//!     name: addressing.queue_for("search"),
//!     topic: addressing.topic(),
//!     selector: Selector::for_types(["Product"]),
//!     durable: true,
//!     prefetch: 100,
//! })?;
//!
//! broker.publish(&addressing.topic(), message.to_wire()?)?;
//! if let Some(delivery) = session.receive(Duration::from_millis(500))? {
//!     session.acknowledge(delivery.tag)?;
//! }
//! ```

mod broker;
mod naming;
mod selector;
mod types;

pub use broker::{Broker, MemoryBroker, MemorySession, Session};
pub use naming::{correlation_matches, Addressing};
pub use selector::Selector;
pub use types::{
    BusMessage, Delivery, DeliveryTag, QueueSpec, WireMessage, HEADER_ACTION, HEADER_ENTITY_ID,
    HEADER_ENTITY_TYPE, HEADER_INITIAL_LOAD, HEADER_INSERTION_TIME, HEADER_JOB_ID, HEADER_KIND,
};
