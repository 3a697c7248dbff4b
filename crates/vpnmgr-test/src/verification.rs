//! Verification helpers for coordinator tests
//!
//! Dispatch happens on background tasks, so assertions wait for a condition
//! with a deadline instead of checking once.

use crate::recorder::RecordingHandler;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use vpnmgr_common::{DependencyCoordinator, ListenerKey, ListenerState};

/// Default deadline for eventual conditions
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

const POLL_STEP: Duration = Duration::from_millis(5);

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("Expected {expected} {what}, found {actual}")]
    CountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Waits until `condition` holds or `deadline` passes.
pub async fn wait_until<F>(what: &str, deadline: Duration, mut condition: F) -> VerifyResult<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(VerificationError::Timeout {
                what: what.to_string(),
                waited: deadline,
            });
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Waits for at least `expected` dispatches, then checks that no more than
/// `expected` arrived.
pub async fn wait_for_dispatches(handler: &RecordingHandler, expected: usize) -> VerifyResult<()> {
    wait_until("dispatches", DEFAULT_DEADLINE, || handler.count() >= expected).await?;
    let actual = handler.count();
    if actual != expected {
        return Err(VerificationError::CountMismatch {
            what: "dispatches".to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Waits until the coordinator holds no deferred event.
pub async fn wait_for_drain<T: Send + Sync + 'static>(
    coordinator: &DependencyCoordinator<T>,
) -> VerifyResult<()> {
    wait_until("pending events to drain", DEFAULT_DEADLINE, || {
        coordinator.pending_count() == 0
    })
    .await
}

/// Waits until the listener for `key` reports `state`.
pub async fn wait_for_listener_state<T: Send + Sync + 'static>(
    coordinator: &DependencyCoordinator<T>,
    key: &ListenerKey,
    state: ListenerState,
) -> VerifyResult<()> {
    wait_until(&format!("listener {} to be {:?}", key, state), DEFAULT_DEADLINE, || {
        coordinator.listener_state(key) == Some(state)
    })
    .await
}

/// Asserts that nothing is dispatched for `window`.
pub async fn assert_quiet(handler: &RecordingHandler, window: Duration) -> VerifyResult<()> {
    let before = handler.count();
    tokio::time::sleep(window).await;
    let after = handler.count();
    if after != before {
        return Err(VerificationError::CountMismatch {
            what: "dispatches during quiet window".to_string(),
            expected: before,
            actual: after,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let result = wait_until("never", Duration::from_millis(50), || false).await;
        assert!(matches!(result, Err(VerificationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_until_succeeds_immediately() {
        assert!(wait_until("always", Duration::from_millis(1), || true).await.is_ok());
    }
}
