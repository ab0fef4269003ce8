//! Retry with exponential backoff for adapter calls.

use std::thread;
use std::time::Duration;

use crate::error::LinkError;

/// Delays between attempts of a retried adapter call.
///
/// The first attempt runs immediately; each configured delay adds one retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    /// Three retries with delays of 250ms, 500ms and 1s.
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(250))
    }
}

impl RetryPolicy {
    /// Builds a policy with `retries` delays doubling from `base`.
    pub fn exponential(retries: usize, base: Duration) -> Self {
        let delays = (0..retries)
            .map(|attempt| base.saturating_mul(1u32 << attempt.min(16)))
            .collect();
        Self { delays }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// A policy that retries `retries` times without sleeping.
    pub fn immediate(retries: usize) -> Self {
        Self {
            delays: vec![Duration::ZERO; retries],
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Runs `f`, retrying transient failures according to `policy`.
///
/// Only errors for which [`LinkError::is_transient`] holds are retried;
/// structural and validation errors return immediately. When all retries are
/// exhausted the last error is returned.
pub fn retry_with_backoff<F, T>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, LinkError>
where
    F: FnMut() -> Result<T, LinkError>,
{
    let mut last_error = match f() {
        Ok(result) => return Ok(result),
        Err(e) if !e.is_transient() => return Err(e),
        Err(e) => e,
    };

    for (attempt, delay) in policy.delays.iter().enumerate() {
        tracing::warn!(
            operation,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "transient failure, retrying"
        );
        if !delay.is_zero() {
            thread::sleep(*delay);
        }

        match f() {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}
