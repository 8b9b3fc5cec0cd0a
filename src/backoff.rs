//! Delay schedules for the retry engine.
//!
//! The primary schedule is capped exponential backoff:
//! `delay(retry) = min(initial << min(retry, max_exponent), max)`, where
//! `max_exponent` is auto-derived from `initial` so the shift can never
//! overflow a signed 64-bit nanosecond count. Retry indices are 0-based: the
//! first retry waits `initial`.
//!
//! Two error-derived adjustments are applied after the schedule:
//! a downstream-supplied retry-after hint raises the delay to at least the
//! hinted duration (it never lowers a larger delay), and a uniformly random
//! jitter in `[0, max_jitter)` is added last. The final sum saturates at
//! `Duration::MAX` rather than wrapping.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use downstream::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.base_delay(1), Duration::from_millis(200));
//! assert_eq!(backoff.base_delay(10), Duration::from_secs(2)); // capped
//! ```

use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// `with_max` is only meaningful for the exponential schedule.
    ConstantDoesNotSupportMax,
    /// The delay cap must be non-zero.
    MaxMustBePositive,
    /// The delay cap must be at least the initial delay.
    MaxLessThanInitial { initial: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanInitial { initial, max } => {
                write!(f, "max ({:?}) must be >= initial ({:?})", max, initial)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { initial: Duration, max: Option<Duration>, max_exponent: Option<u32> },
}

/// A delay schedule: constant, or capped exponential with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
    max_jitter: Duration,
    ignore_retry_after: bool,
}

/// Largest shift such that `nanos << shift` stays within a signed 64-bit
/// nanosecond count. Zero initial delays shift to zero regardless.
fn safe_exponent(initial: Duration) -> u32 {
    let nanos = u64::try_from(initial.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return 0;
    }
    let bits = u64::BITS - nanos.leading_zeros();
    63 - bits.min(63)
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Constant { delay },
            max_jitter: Duration::ZERO,
            ignore_retry_after: false,
        }
    }

    /// Exponential backoff starting at `initial`, doubling each retry.
    pub fn exponential(initial: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential { initial, max: None, max_exponent: None },
            max_jitter: Duration::ZERO,
            ignore_retry_after: false,
        }
    }

    /// Cap the computed delay. Errors on the constant schedule, on a zero
    /// cap, or on a cap below the initial delay.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { initial, max: existing, .. } => {
                if max < *initial {
                    return Err(BackoffError::MaxLessThanInitial { initial: *initial, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Cap the doubling exponent explicitly. Only lowers the auto-derived
    /// overflow-safe cap; a larger value has no effect.
    pub fn with_max_exponent(mut self, exponent: u32) -> Self {
        if let BackoffKind::Exponential { max_exponent, .. } = &mut self.kind {
            *max_exponent = Some(exponent);
        }
        self
    }

    /// Add a uniformly random jitter in `[0, max_jitter)` to every delay.
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Do not raise delays to a downstream-supplied retry-after hint.
    pub fn ignore_retry_after(mut self) -> Self {
        self.ignore_retry_after = true;
        self
    }

    /// The deterministic scheduled delay for the given 0-based retry index,
    /// before the retry-after hint and jitter are applied.
    pub fn base_delay(&self, retry: usize) -> Duration {
        match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Exponential { initial, max, max_exponent } => {
                let mut cap = safe_exponent(*initial);
                if let Some(explicit) = max_exponent {
                    cap = cap.min(*explicit);
                }
                let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(cap);
                let nanos = u64::try_from(initial.as_nanos()).unwrap_or(u64::MAX) << shift;
                let delay = Duration::from_nanos(nanos);
                max.map(|m| delay.min(m)).unwrap_or(delay)
            }
        }
    }

    /// The full delay for a retry: scheduled delay, raised to `retry_after`
    /// when a positive hint is present and honored, plus random jitter.
    pub fn delay(&self, retry: usize, retry_after: Option<Duration>) -> Duration {
        self.delay_with_rng(retry, retry_after, &mut rand::rng())
    }

    /// Like [`Backoff::delay`], with an injected RNG for deterministic tests.
    pub fn delay_with_rng<R: Rng>(
        &self,
        retry: usize,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let mut delay = self.base_delay(retry);
        if !self.ignore_retry_after {
            if let Some(hint) = retry_after {
                if hint > delay {
                    delay = hint;
                }
            }
        }
        let jitter_nanos = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter_nanos > 0 {
            let jitter = Duration::from_nanos(rng.random_range(0..jitter_nanos));
            delay = delay.checked_add(jitter).unwrap_or(Duration::MAX);
        }
        delay
    }

    /// The configured jitter bound.
    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }
}
