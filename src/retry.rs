//! Retry policies for management-plane requests.
//!
//! A policy is a decision function: given the operation that failed, the classified error, and the
//! time left before the operation deadline, it returns the delay before the next attempt or
//! `None` to give up and surface the error.
//!
//! Every policy here returns `None` when:
//! - the error is not retryable (see [`ClientError::is_retryable`]),
//! - no time remains, or
//! - the next delay would land past the deadline.
//!
//! ```rust
//! use std::time::Duration;
//! use eventline::{ClientError, ExponentialRetryPolicy, RetryPolicy};
//!
//! let policy = ExponentialRetryPolicy::builder()
//!     .min_backoff(Duration::from_millis(50))
//!     .max_backoff(Duration::from_secs(5))
//!     .max_retry_count(3)
//!     .build()
//!     .unwrap();
//! let busy = ClientError::ServerBusy("throttled".into());
//! let fatal = ClientError::Validation("bad".into());
//! assert!(policy.next_retry_interval("client-a", &fatal, Duration::from_secs(60)).is_none());
//! assert!(policy.next_retry_interval("client-a", &busy, Duration::from_secs(60)).is_some());
//! ```

use crate::{Backoff, ClientError, Jitter};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Extra wait added when the service reports it is busy.
pub const SERVER_BUSY_BASE_WAIT: Duration = Duration::from_secs(4);

/// Pluggable retry decision.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before the next attempt, or `None` to stop retrying.
    ///
    /// `operation` identifies one retry loop; the management layer passes a key unique to each
    /// call, so history kept under it belongs to that call alone.
    fn next_retry_interval(
        &self,
        operation: &str,
        last_error: &ClientError,
        remaining: Duration,
    ) -> Option<Duration>;

    /// Forget any attempt history kept for `operation`; called once its loop settles.
    fn reset_retry_count(&self, _operation: &str) {}
}

/// Never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_retry_interval(&self, _: &str, _: &ClientError, _: Duration) -> Option<Duration> {
        None
    }
}

/// Retries retryable errors after a fixed delay, clipped to the remaining time.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelayRetryPolicy {
    delay: Duration,
}

impl FixedDelayRetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryPolicy for FixedDelayRetryPolicy {
    fn next_retry_interval(
        &self,
        _client_id: &str,
        last_error: &ClientError,
        remaining: Duration,
    ) -> Option<Duration> {
        if remaining.is_zero() || !last_error.is_retryable() {
            return None;
        }
        Some(self.delay.min(remaining))
    }
}

/// Exponential policy with per-operation retry counters.
///
/// Delay for the n-th retry of an operation is `min_backoff + jitter(backoff(n))`, plus
/// [`SERVER_BUSY_BASE_WAIT`] when the last error was [`ClientError::ServerBusy`]. The counter
/// for an operation grows with every granted retry and is cleared by
/// [`RetryPolicy::reset_retry_count`].
#[derive(Debug)]
pub struct ExponentialRetryPolicy {
    min_backoff: Duration,
    backoff: Backoff,
    jitter: Jitter,
    max_retry_count: u32,
    retry_counts: Mutex<HashMap<String, u32>>,
}

impl ExponentialRetryPolicy {
    pub fn builder() -> ExponentialRetryPolicyBuilder {
        ExponentialRetryPolicyBuilder::new()
    }

    /// Retries granted so far to `operation` since its last reset.
    pub fn retry_count(&self, operation: &str) -> u32 {
        let counts = self.retry_counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(operation).copied().unwrap_or(0)
    }

    /// Number of operations with a live retry counter.
    pub fn tracked_operations(&self) -> usize {
        self.retry_counts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        ExponentialRetryPolicyBuilder::new().assemble()
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn next_retry_interval(
        &self,
        operation: &str,
        last_error: &ClientError,
        remaining: Duration,
    ) -> Option<Duration> {
        if remaining.is_zero() || !last_error.is_retryable() {
            return None;
        }

        let mut counts = self.retry_counts.lock().unwrap_or_else(PoisonError::into_inner);
        let granted = counts.get(operation).copied().unwrap_or(0);
        if granted >= self.max_retry_count {
            return None;
        }

        let mut delay = self.min_backoff.saturating_add(self.jitter.apply(self.backoff.delay(granted + 1)));
        if last_error.is_server_busy() {
            delay = delay.saturating_add(SERVER_BUSY_BASE_WAIT);
        }
        if delay > remaining {
            return None;
        }

        counts.insert(operation.to_string(), granted + 1);
        Some(delay)
    }

    fn reset_retry_count(&self, operation: &str) {
        let mut counts = self.retry_counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.remove(operation);
    }
}

/// Errors produced while building an exponential policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max_backoff ({max:?}) must be >= min_backoff ({min:?}) and non-zero")]
    InvalidBackoffRange { min: Duration, max: Duration },
    #[error("max_retry_count must be > 0")]
    ZeroRetryCount,
}

/// Builder for [`ExponentialRetryPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicyBuilder {
    min_backoff: Duration,
    max_backoff: Duration,
    max_retry_count: u32,
    jitter: Jitter,
}

impl ExponentialRetryPolicyBuilder {
    /// Defaults: no floor, 30s cap, 10 retries, no jitter.
    pub fn new() -> Self {
        Self {
            min_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(30),
            max_retry_count: 10,
            jitter: Jitter::None,
        }
    }

    pub fn min_backoff(mut self, min: Duration) -> Self {
        self.min_backoff = min;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<ExponentialRetryPolicy, RetryPolicyError> {
        if self.max_backoff.is_zero() || self.max_backoff < self.min_backoff {
            return Err(RetryPolicyError::InvalidBackoffRange {
                min: self.min_backoff,
                max: self.max_backoff,
            });
        }
        if self.max_retry_count == 0 {
            return Err(RetryPolicyError::ZeroRetryCount);
        }
        Ok(self.assemble())
    }

    // Growth starts at one second, the way the service documents its retry guidance, and is
    // capped so that min + curve never exceeds max.
    fn assemble(self) -> ExponentialRetryPolicy {
        let span = self.max_backoff.saturating_sub(self.min_backoff);
        let base = Duration::from_secs(1).min(span);
        let backoff = match Backoff::exponential(base).with_max(span) {
            Ok(capped) => capped,
            Err(_) => Backoff::constant(Duration::ZERO),
        };
        ExponentialRetryPolicy {
            min_backoff: self.min_backoff,
            backoff,
            jitter: self.jitter,
            max_retry_count: self.max_retry_count,
            retry_counts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ExponentialRetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
