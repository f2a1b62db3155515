//! Cancellation shared by every loop in the process.
//!
//! Cancelling drops the only sender, so every clone of the receiver observes
//! disconnection at once. Sleeps built on it return as soon as that happens.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Cloneable cancellation token.
#[derive(Clone)]
pub struct Shutdown {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(sender))),
            signal: receiver,
        }
    }

    /// Cancel every holder of this token. Idempotent.
    pub fn cancel(&self) {
        self.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(
            self.signal.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Receiver that disconnects on cancel, for use in `select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sleep_elapses() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)));
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();

        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let completed = other.sleep(Duration::from_secs(30));
            (completed, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        shutdown.cancel();

        let (completed, elapsed) = handle.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
        assert!(shutdown.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        shutdown.cancel();
        assert!(shutdown.is_cancelled());
        assert!(!shutdown.sleep(Duration::from_millis(1)));
    }
}
