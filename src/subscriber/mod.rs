//! Subscriber side of the bus.
//!
//! A `SubscriberRuntime` drives one `Consumer` through
//! `Idle -> Ready -> Receiving -> Validating -> Dispatching -> Acknowledging`,
//! branching to `Recovering` when the destination is not ready or dispatch
//! fails. Delivery is single-threaded per session, so one message finishes
//! before the next is received.
//!
//! # Example
//!
//! ```ignore
//! let runtime = SubscriberRuntime::open(&config, consumer, broker, verbosity, shutdown.clone())?;
//! std::thread::spawn(move || runtime.run());
//! ```

mod consumer;
mod registry;
mod runtime;

pub use consumer::{Consumer, Dispatch};
pub use registry::EntityTypeRegistry;
pub use runtime::{Outcome, RuntimeState, RuntimeStats, SubscriberRuntime};
