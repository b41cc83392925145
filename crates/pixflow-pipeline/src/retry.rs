//! Bounded retry with exponential backoff
//!
//! A [`RetryPolicy`] decides how long to wait between attempts; [`retry`]
//! drives an async operation under a policy, logging every retry and racing
//! each backoff sleep against a cancellation token.

use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, for tests and tight loops
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    pub fn should_retry<E: Retryable>(&self, error: &E, state: &RetryState) -> bool {
        error.is_transient() && state.attempt <= self.max_retries
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 1,
            next_delay: self.delay_for(1),
        }
    }
}

/// Progress through one retry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempt currently being made (1-based)
    pub attempt: u32,
    /// Delay to wait if this attempt fails
    pub next_delay: Duration,
}

impl RetryState {
    fn advance(&mut self, policy: &RetryPolicy) {
        self.attempt += 1;
        self.next_delay = policy.delay_for(self.attempt);
    }
}

/// How a retry sequence ended without success
#[derive(Debug)]
pub enum RetryError<E> {
    /// Non-transient error; no further attempts were made
    Permanent { error: E, attempts: u32 },
    /// Every allowed attempt failed; `error` is the last one
    Exhausted { error: E, attempts: u32 },
    /// Cancelled during a backoff sleep
    Cancelled { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Permanent { error, .. }
            | RetryError::Exhausted { error, .. }
            | RetryError::Cancelled { error, .. } => error,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy or
/// `cancel` fires during a backoff. Returns the value and the attempt count.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut state = policy.start();
    loop {
        let error = match op(state.attempt).await {
            Ok(value) => return Ok((value, state.attempt)),
            Err(error) => error,
        };

        if !error.is_transient() {
            return Err(RetryError::Permanent {
                error,
                attempts: state.attempt,
            });
        }
        if !policy.should_retry(&error, &state) {
            return Err(RetryError::Exhausted {
                error,
                attempts: state.attempt,
            });
        }

        warn!(
            operation,
            attempt = state.attempt,
            max_attempts = policy.max_attempts(),
            delay_ms = state.next_delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    error,
                    attempts: state.attempt,
                });
            }
            _ = tokio::time::sleep(state.next_delay) => {}
        }
        state.advance(policy);
    }
}
