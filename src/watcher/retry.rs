//! Bounded retry for provider calls
//!
//! Delays (secs, with 10% jitter): 0.4, 0.8, 1.6, 3.2, ... capped at
//! `max_interval`, until `max_elapsed` has passed. Only
//! `WatcherError::Transient` is retried.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;

use super::{WatcherError, WatcherResult};

/// Backoff parameters shared by watchers and the live subscription
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn new(max_elapsed: Duration) -> Self {
        Self {
            initial_interval: Duration::from_millis(400),
            max_interval: Duration::from_secs(30),
            max_elapsed,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the policy gives up
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> WatcherResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WatcherResult<T>>,
{
    backoff::future::retry(policy.backoff(), || {
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e @ WatcherError::Transient(_)) => {
                    tracing::debug!("Retrying {} due to error: {}", what, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}
