//! Bounded retry with a fixed interval.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Attempt budget and spacing for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The error from the final attempt.
    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, at most `attempts` times, sleeping `interval`
/// between failures. An attempt budget of zero still runs `op` once.
pub async fn retry_interval<T, E, F, Fut>(
    attempts: u32,
    interval: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(last) if attempt >= attempts => {
                return Err(RetryError::Exhausted { attempts, last });
            }
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// [`retry_interval`] driven by a [`RetryPolicy`].
pub async fn retry_with<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_interval(policy.attempts, policy.interval, op).await
}
