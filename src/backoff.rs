//! Backoff curves used by the retry policies.
//!
//! A curve maps a 1-based retry number to a delay. Retry `0` is the initial attempt and always
//! maps to zero. Arithmetic saturates at [`MAX_BACKOFF`] instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use eventline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(9), Duration::from_secs(1));
//! ```

use std::fmt;
use std::time::Duration;

/// Upper bound for any computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
    FactorTooSmall(u32),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "a constant backoff cannot be capped")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::FactorTooSmall(factor) => {
                write!(f, "exponential factor must be >= 2 (got {})", factor)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Delay curve between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay for every retry.
    Constant(Duration),
    /// `step * retry`, optionally capped.
    Linear { step: Duration, max: Option<Duration> },
    /// `base * factor^(retry - 1)`, optionally capped.
    Exponential { base: Duration, factor: u32, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant(delay)
    }

    pub fn linear(step: Duration) -> Self {
        Backoff::Linear { step, max: None }
    }

    /// Doubling curve starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, factor: 2, max: None }
    }

    /// Change the growth factor of an exponential curve. Other curves are returned unchanged.
    pub fn with_factor(self, factor: u32) -> Result<Self, BackoffError> {
        if factor < 2 {
            return Err(BackoffError::FactorTooSmall(factor));
        }
        Ok(match self {
            Backoff::Exponential { base, max, .. } => Backoff::Exponential { base, factor, max },
            other => other,
        })
    }

    /// Cap a linear or exponential curve.
    pub fn with_max(self, cap: Duration) -> Result<Self, BackoffError> {
        if cap.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match self {
            Backoff::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
            Backoff::Linear { step, .. } if cap < step => {
                Err(BackoffError::MaxLessThanBase { base: step, max: cap })
            }
            Backoff::Linear { step, .. } => Ok(Backoff::Linear { step, max: Some(cap) }),
            Backoff::Exponential { base, .. } if cap < base => {
                Err(BackoffError::MaxLessThanBase { base, max: cap })
            }
            Backoff::Exponential { base, factor, .. } => {
                Ok(Backoff::Exponential { base, factor, max: Some(cap) })
            }
        }
    }

    /// Delay before retry number `retry` (1-based; `0` is the initial attempt).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let (raw, cap) = match self {
            Backoff::Constant(delay) => (*delay, None),
            Backoff::Linear { step, max } => {
                (step.checked_mul(retry).unwrap_or(MAX_BACKOFF), *max)
            }
            Backoff::Exponential { base, factor, max } => {
                let multiplier = u128::from(*factor).saturating_pow(retry - 1);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                (Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64), *max)
            }
        };
        cap.map_or(raw, |c| raw.min(c)).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_attempt_has_no_delay() {
        assert_eq!(Backoff::constant(Duration::from_secs(3)).delay(0), Duration::ZERO);
        assert_eq!(Backoff::linear(Duration::from_secs(3)).delay(0), Duration::ZERO);
        assert_eq!(Backoff::exponential(Duration::from_secs(3)).delay(0), Duration::ZERO);
    }

    #[test]
    fn linear_grows_by_step() {
        let backoff = Backoff::linear(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn exponential_respects_factor_and_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(10))
            .with_factor(3)
            .unwrap()
            .with_max(Duration::from_millis(500))
            .unwrap();
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(30));
        assert_eq!(backoff.delay(3), Duration::from_millis(90));
        assert_eq!(backoff.delay(5), Duration::from_millis(500));
    }

    #[test]
    fn huge_retry_numbers_saturate() {
        assert_eq!(Backoff::exponential(Duration::from_secs(1)).delay(u32::MAX), MAX_BACKOFF);
        assert_eq!(Backoff::linear(Duration::from_secs(u64::MAX / 4)).delay(9), MAX_BACKOFF);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert_eq!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        );
        assert!(matches!(
            Backoff::linear(Duration::from_secs(5)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_factor(1),
            Err(BackoffError::FactorTooSmall(1))
        );
    }
}
