//! Fixed-delay retry of transient connectivity failures.

use crate::error::{Result, SyncError};
use crate::shutdown::Shutdown;
use std::time::Duration;
use tracing::warn;

/// How long to keep retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Steady-state operations: retry until success or shutdown.
    Unbounded,
    /// Setup operations: give up after this many attempts.
    Attempts(u32),
}

/// Run `op`, re-entering it after `delay` while it fails transiently.
///
/// Non-transient errors are returned immediately. Cancellation during the
/// delay yields `SyncError::Cancelled`.
pub fn with_fixed_delay<T>(
    shutdown: &Shutdown,
    delay: Duration,
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if let RetryPolicy::Attempts(max) = policy {
                    if attempt >= max {
                        return Err(SyncError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                }
                warn!(operation = what, attempt, error = %e, "Transient failure, retrying");
                if !shutdown.sleep(delay) {
                    return Err(SyncError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_until_success() {
        let shutdown = Shutdown::new();
        let mut calls = 0;
        let value = with_fixed_delay(
            &shutdown,
            Duration::from_millis(1),
            RetryPolicy::Unbounded,
            "test",
            || {
                calls += 1;
                if calls < 3 {
                    Err(SyncError::BrokerUnavailable("refused".into()))
                } else {
                    Ok(calls)
                }
            },
        )
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_bounded_attempts_exhaust() {
        let shutdown = Shutdown::new();
        let mut calls = 0;
        let result: Result<()> = with_fixed_delay(
            &shutdown,
            Duration::from_millis(1),
            RetryPolicy::Attempts(4),
            "connect",
            || {
                calls += 1;
                Err(SyncError::BrokerUnavailable("refused".into()))
            },
        );
        assert_eq!(calls, 4);
        assert!(matches!(
            result,
            Err(SyncError::RetriesExhausted { attempts: 4, .. })
        ));
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let shutdown = Shutdown::new();
        let mut calls = 0;
        let result: Result<()> = with_fixed_delay(
            &shutdown,
            Duration::from_millis(1),
            RetryPolicy::Unbounded,
            "write",
            || {
                calls += 1;
                Err(SyncError::InvalidMessage("bad".into()))
            },
        );
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(SyncError::InvalidMessage(_))));
    }

    #[test]
    fn test_cancel_stops_retry() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let result: Result<()> = with_fixed_delay(
            &shutdown,
            Duration::from_secs(60),
            RetryPolicy::Unbounded,
            "write",
            || Err(SyncError::StorageUnavailable("down".into())),
        );
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
