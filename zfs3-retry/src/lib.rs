//! Retry budgets and backoff schedules for zfs3 uploads
//!
//! A [`RetryPolicy`] is the immutable description of how often and how patiently an
//! operation may be retried. Each retried item owns a [`BackoffSchedule`] derived from
//! the policy; the schedule counts failures and hands out the next delay, so the retry
//! ceiling and the delay shape can be tested without doing any I/O.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors produced by [`with_backoff`]
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// How many times an operation may be retried and how long to wait in between.
///
/// Delays grow exponentially from `initial_delay` by `multiplier` and are capped at
/// `max_delay`. No jitter is applied, so the sequence of delays for one item never
/// decreases.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Policy with the default delay curve (200ms doubling up to 10s)
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }

    /// Policy that retries without waiting; meant for tests and dry runs
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Replace the delay curve, keeping the retry ceiling
    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay.max(initial_delay);
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Total attempts an always-failing operation gets: the first one plus every retry
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Start a fresh schedule for one item
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            max_retries: self.max_retries,
            max_delay: self.max_delay,
            failures: 0,
            last_delay: Duration::ZERO,
            backoff: self.exponential(),
        }
    }

    fn exponential(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier.max(1.0))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Outcome of reporting one failure to a [`BackoffSchedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `attempt` is the zero-based index of the next attempt
    Retry { attempt: u32, delay: Duration },
    /// The budget is spent; `attempts` is the number of attempts made
    Exhausted { attempts: u32 },
}

/// Failure counter and delay sequence for a single retried item
#[derive(Debug)]
pub struct BackoffSchedule {
    max_retries: u32,
    max_delay: Duration,
    failures: u32,
    last_delay: Duration,
    backoff: ExponentialBackoff,
}

impl BackoffSchedule {
    /// Record a failed attempt and decide what happens next
    pub fn on_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_retries {
            return RetryDecision::Exhausted {
                attempts: self.failures,
            };
        }

        let next = self.backoff.next_backoff().unwrap_or(self.max_delay);
        // clamp so the sequence stays monotone even at the cap
        let delay = next.max(self.last_delay);
        self.last_delay = delay;

        RetryDecision::Retry {
            attempt: self.failures,
            delay,
        }
    }

    /// Failed attempts recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether another failure would exhaust the budget
    pub fn is_last_attempt(&self) -> bool {
        self.failures >= self.max_retries
    }
}

/// Run `f` until it succeeds or the policy's budget is spent.
///
/// The closure receives the zero-based attempt index. Every error is treated as
/// retryable; the last one is returned inside [`RetryError::Exhausted`].
pub async fn with_backoff<F, Fut, T, E>(op_name: &str, policy: &RetryPolicy, mut f: F) -> RetryResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut schedule = policy.schedule();
    let mut attempt = 0;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt + 1);

        match f(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation '{}' succeeded after {} attempts", op_name, attempt + 1);
                }
                return Ok(result);
            }
            Err(err) => match schedule.on_failure() {
                RetryDecision::Retry { attempt: next, delay } => {
                    warn!(
                        "Operation '{}' failed on attempt {}: {}. Retrying in {:?}",
                        op_name,
                        attempt + 1,
                        err,
                        delay
                    );
                    attempt = next;
                    sleep(delay).await;
                }
                RetryDecision::Exhausted { attempts } => {
                    warn!("Operation '{}' gave up after {} attempts: {}", op_name, attempts, err);
                    return Err(RetryError::Exhausted {
                        operation: op_name.to_string(),
                        attempts,
                        source: Box::new(err),
                    });
                }
            },
        }
    }
}

#[cfg(feature = "async-rt")]
async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(not(feature = "async-rt"))]
async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
