//! Control plane.
//!
//! Operation messages share the bus with data but are never tracked or
//! moderated. Every subscriber's selector admits them, and the correlation id
//! (or the payload's `target`) picks which subscribers act on them.

mod handler;
mod operation;

pub use handler::{ControlPlaneHandler, TypeListener};
pub use operation::{ControlMessage, OperationType};
