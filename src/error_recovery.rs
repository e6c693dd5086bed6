//! Retry policies for instrument communication.
//
// The attention handshake and the sampling cycle both retry transient
// failures a bounded number of times. The handshake waits a short fixed
// backoff between probes; the cycle restarts from power-up instead.

use crate::error::DaqError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` tries and the default 100 ms backoff.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// An asynchronous operation that can be retried.
#[async_trait]
pub trait Recoverable<E> {
    /// Make one attempt.
    async fn recover(&mut self) -> Result<(), E>;
}

/// Retries `recoverable` according to `policy`.
///
/// Returns the number of attempts it took to succeed, or the error of the
/// last attempt once `max_attempts` is exhausted. No backoff is applied
/// after the final failure.
pub async fn handle_recoverable_error<T>(
    recoverable: &mut T,
    policy: &RetryPolicy,
) -> Result<u32, DaqError>
where
    T: Recoverable<DaqError> + Send + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match recoverable.recover().await {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                debug!(attempt, max_attempts, error = %e, "recoverable operation failed");
                last_error = Some(e);
            }
        }
        if attempt < max_attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(last_error.unwrap_or(DaqError::AttentionFailed {
        tries: max_attempts,
    }))
}
