use crate::control::ControlMessage;
use crate::error::{Result, SyncError};
use crate::fabric::BusMessage;
use crate::types::MessageKind;

/// How a consumer disposed of one data message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dispatch {
    Applied,
    /// The message can never apply. It is acknowledged and skipped.
    Rejected,
    /// The destination failed; the message is redelivered.
    Retry,
}

impl Dispatch {
    /// Malformed input is rejected; any other error is retried.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Dispatch::Applied,
            Err(SyncError::InvalidMessage(_)) => Dispatch::Rejected,
            Err(_) => Dispatch::Retry,
        }
    }

    /// The worse of two step outcomes.
    pub fn and(self, other: Dispatch) -> Dispatch {
        self.max(other)
    }
}

/// What a consumer variant plugs into the subscriber runtime.
///
/// The runtime owns delivery, validation, tracking and acknowledgement; a
/// consumer only applies data and operations to its own destination.
pub trait Consumer: Send + Sync {
    /// Subscriber name; also the correlation id it accepts.
    fn name(&self) -> &str;

    /// Entity types handled when no registration exists yet.
    fn handled_types(&self) -> Vec<String>;

    /// Durable consumers use client acknowledgement and get redelivery.
    fn is_durable(&self) -> bool {
        true
    }

    /// Whether the consumer takes part in full resyncs (`Initialize`).
    fn handles_initial_load(&self) -> bool {
        true
    }

    /// Custom integrations are registered as such.
    fn is_custom(&self) -> bool {
        false
    }

    /// Readiness gate, e.g. the destination host is reachable.
    fn is_ready(&self) -> bool {
        true
    }

    /// One-off setup before the first receive. An error here is fatal.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn process_data(&self, kind: MessageKind, message: &BusMessage) -> Dispatch;

    fn process_operation(&self, operation: &ControlMessage) -> bool;
}
