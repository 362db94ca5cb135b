//! Bounded retry with exponential backoff.
//!
//! Two independent layers use this: the orchestrator retries transient remote
//! failures for a whole datatype pass, and the pipeline retries integrity
//! failures for a single object. Each layer owns its own [`RetryPolicy`] and
//! its own attempt counter.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::{FailureKind, IngestError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Label used in log lines.
    pub operation: &'static str,
    pub max_attempts: u32,
    pub retry_on: Vec<FailureKind>,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn transient_remote() -> Self {
        Self {
            operation: "remote sync",
            max_attempts: 5,
            retry_on: vec![FailureKind::Transient],
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    pub fn integrity() -> Self {
        Self {
            operation: "download and verify",
            max_attempts: 3,
            retry_on: vec![FailureKind::Integrity],
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn without_delay(mut self) -> Self {
        self.initial_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self.jitter = false;
        self
    }

    pub fn is_retryable(&self, error: &IngestError) -> bool {
        self.retry_on.contains(&error.kind())
    }

    /// Runs `operation` until it succeeds, fails with a kind this policy does
    /// not retry, or `max_attempts` is reached. The closure receives the
    /// 1-based attempt number.
    pub fn run<T, F>(&self, mut operation: F) -> Result<Attempted<T>, RetryFailure>
    where
        F: FnMut(u32) -> Result<T, IngestError>,
    {
        let mut attempt = 1;
        let mut delay = self.initial_delay;
        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation = self.operation,
                            attempts = attempt,
                            "succeeded after retry"
                        );
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if self.is_retryable(&error) && attempt < self.max_attempts => {
                    tracing::warn!(
                        operation = self.operation,
                        error = %error,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    let wait = if self.jitter { add_jitter(delay) } else { delay };
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    delay = Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier)
                        .min(self.max_delay);
                    attempt += 1;
                }
                Err(error) => {
                    let exhausted = self.is_retryable(&error);
                    if exhausted {
                        tracing::error!(
                            operation = self.operation,
                            error = %error,
                            attempts = attempt,
                            "all retry attempts exhausted"
                        );
                    }
                    return Err(RetryFailure {
                        attempts: attempt,
                        exhausted,
                        error,
                    });
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    /// `true` when the last error was retryable but no attempts were left.
    pub exhausted: bool,
    pub error: IngestError,
}

/// Spreads the delay by ±25% so parallel workers do not retry in lockstep.
fn add_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
