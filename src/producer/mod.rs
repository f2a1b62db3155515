//! Outbox extraction.
//!
//! A producer feeds one consumer class. Each cycle checks broker storage
//! usage, pages through pending rows in priority order, publishes them to the
//! export topic, stamps the producer's completion bit and prunes rows every
//! producer has stamped.
//!
//! # Example
//!
//! ```ignore
//! let producer = BatchProducer::new(&config, config.producers[0].clone(), outbox, broker, shutdown.clone());
//! let sent = producer.run_cycle("Product")?;
//! ```

mod batch;
mod scheduler;

pub use batch::{decode_payload, BatchProducer};
pub use scheduler::ProducerLoop;
