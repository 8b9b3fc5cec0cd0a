//! Error types shared by the pool, retry engine, and circuit breaker.
//!
//! All three components speak one generic error enum, [`CallError`], so the
//! retry engine's filters can classify failures produced anywhere on the
//! pool → breaker → retry call path without downcasting. Capabilities that
//! cannot be expressed as variants (a downstream-supplied "retry after this
//! long" hint) are expressed as concrete wrapper errors found by walking the
//! `source` chain.

use std::fmt;
use std::time::Duration;

/// Unified error for downstream calls.
///
/// `E` is the caller's own error type; it appears in [`CallError::Inner`] for
/// ordinary operation failures, in [`CallError::Opener`] when the pool's
/// connection opener fails, and in [`CallError::Unrecoverable`] when the
/// operation has marked its failure as never-retryable.
#[derive(Debug, Clone)]
pub enum CallError<E> {
    /// The pool has `max` clients checked out; no more can be opened.
    PoolExhausted {
        /// Checked-out client count at the time of the failure.
        active: i32,
        /// The pool's capacity.
        max: i32,
    },
    /// The circuit breaker refused the call without running it.
    CircuitOpen {
        /// Breaker name, for observability only.
        name: String,
    },
    /// The call context was canceled before or between attempts.
    Canceled,
    /// The pool's opener failed while creating or replacing a client.
    Opener(E),
    /// The operation failed and has declared the failure permanent.
    /// The retry engine returns this immediately, overriding every filter.
    Unrecoverable(E),
    /// Every attempt failed; `failures` holds each attempt's error in order.
    AttemptsExhausted {
        /// Number of attempts actually made. Always equals `failures.len()`.
        attempts: usize,
        /// Per-attempt errors, oldest first.
        failures: Vec<CallError<E>>,
    },
    /// The operation itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted { active, max } => {
                write!(f, "pool exhausted ({} active of {} max)", active, max)
            }
            Self::CircuitOpen { name } => write!(f, "circuit breaker '{}' is open", name),
            Self::Canceled => write!(f, "call canceled"),
            Self::Opener(e) => write!(f, "failed to open client: {}", e),
            Self::Unrecoverable(e) => write!(f, "unrecoverable: {}", e),
            Self::AttemptsExhausted { attempts, failures } => {
                if let Some(last) = failures.last() {
                    write!(f, "all {} attempts failed; last error: {}", attempts, last)
                } else {
                    write!(f, "all {} attempts failed", attempts)
                }
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) | Self::Opener(e) | Self::Unrecoverable(e) => Some(e),
            Self::AttemptsExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> CallError<E> {
    /// Build an `AttemptsExhausted` error from the full list of per-attempt
    /// failures. The attempt count is derived from the list so the two can
    /// never disagree.
    pub fn attempts_exhausted(failures: Vec<CallError<E>>) -> Self {
        Self::AttemptsExhausted { attempts: failures.len(), failures }
    }

    /// True if this error is, or aggregates, a pool-exhausted failure.
    pub fn is_pool_exhausted(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            Self::AttemptsExhausted { failures, .. } => {
                failures.iter().any(CallError::is_pool_exhausted)
            }
            _ => false,
        }
    }

    /// True if this error is, or aggregates, a breaker fail-fast rejection.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::AttemptsExhausted { failures, .. } => {
                failures.iter().any(CallError::is_circuit_open)
            }
            _ => false,
        }
    }

    /// True if the call context was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// True if the operation marked its failure permanent.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }

    /// True if every attempt was exhausted.
    pub fn is_attempts_exhausted(&self) -> bool {
        matches!(self, Self::AttemptsExhausted { .. })
    }

    /// The caller's error, if this wraps one directly.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) | Self::Opener(e) | Self::Unrecoverable(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the caller's error, if this wraps one directly.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) | Self::Opener(e) | Self::Unrecoverable(e) => Some(e),
            _ => None,
        }
    }

    /// Per-attempt failures, if this is an exhaustion aggregate.
    pub fn failures(&self) -> Option<&[CallError<E>]> {
        match self {
            Self::AttemptsExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// Pool occupancy at the time of an exhaustion failure, as `(active, max)`.
    pub fn pool_occupancy(&self) -> Option<(i32, i32)> {
        match self {
            Self::PoolExhausted { active, max } => Some((*active, *max)),
            _ => None,
        }
    }
}

impl<E: std::error::Error + 'static> CallError<E> {
    /// The downstream's "retry after" hint, if the wrapped error carries one
    /// anywhere in its `source` chain.
    pub fn retry_after(&self) -> Option<Duration> {
        self.as_inner().and_then(|e| retry_after_of(e))
    }
}

/// Capability reported by errors that know whether retrying can help.
///
/// `Some(true)` means a retry may succeed, `Some(false)` means it cannot, and
/// `None` means the error has no opinion and classification falls through to
/// the next filter in the chain.
pub trait Retryable {
    fn retryable(&self) -> Option<bool>;
}

/// Wrapper error carrying a downstream-supplied minimum wait before retrying.
///
/// A transport layer that receives e.g. an HTTP 429 with `Retry-After` wraps
/// its error in this type; the retry engine finds it by walking the `source`
/// chain and raises the computed backoff delay to at least `after`.
#[derive(Debug)]
pub struct RetryAfterError {
    after: Duration,
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl RetryAfterError {
    pub fn new<E>(after: Duration, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { after, source: Box::new(source) }
    }

    /// Minimum wait requested by the downstream.
    pub fn after(&self) -> Duration {
        self.after
    }
}

impl fmt::Display for RetryAfterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (retry after {:?})", self.source, self.after)
    }
}

impl std::error::Error for RetryAfterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Walk an error's `source` chain looking for a positive retry-after hint.
pub fn retry_after_of(err: &(dyn std::error::Error + 'static)) -> Option<Duration> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(ra) = e.downcast_ref::<RetryAfterError>() {
            return (ra.after > Duration::ZERO).then_some(ra.after);
        }
        current = e.source();
    }
    None
}

/// Walk an error's `source` chain looking for a transport-level I/O error.
pub(crate) fn io_error_of<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn pool_exhausted_display_names_occupancy() {
        let err: CallError<DummyError> = CallError::PoolExhausted { active: 3, max: 3 };
        let msg = format!("{}", err);
        assert!(msg.contains("pool exhausted"));
        assert!(msg.contains("3 active of 3 max"));
        assert_eq!(err.pool_occupancy(), Some((3, 3)));
    }

    #[test]
    fn circuit_open_display_names_breaker() {
        let err: CallError<DummyError> = CallError::CircuitOpen { name: "redis".into() };
        assert!(format!("{}", err).contains("'redis'"));
        assert!(err.is_circuit_open());
    }

    #[test]
    fn attempts_exhausted_length_matches_attempts() {
        let failures = vec![
            CallError::Inner(DummyError("first")),
            CallError::Inner(DummyError("second")),
            CallError::Inner(DummyError("third")),
        ];
        let err = CallError::attempts_exhausted(failures);
        match &err {
            CallError::AttemptsExhausted { attempts, failures } => {
                assert_eq!(*attempts, 3);
                assert_eq!(failures.len(), 3);
            }
            other => panic!("expected AttemptsExhausted, got {:?}", other),
        }
        let msg = format!("{}", err);
        assert!(msg.contains("all 3 attempts failed"));
        assert!(msg.contains("third"));
    }

    #[test]
    fn exhaustion_aggregate_answers_wrapped_queries() {
        let err: CallError<DummyError> = CallError::attempts_exhausted(vec![
            CallError::Inner(DummyError("x")),
            CallError::PoolExhausted { active: 2, max: 2 },
        ]);
        assert!(err.is_pool_exhausted());
        assert!(!err.is_circuit_open());

        let err: CallError<DummyError> =
            CallError::attempts_exhausted(vec![CallError::CircuitOpen { name: "db".into() }]);
        assert!(err.is_circuit_open());
    }

    #[test]
    fn source_points_at_wrapped_error() {
        let err: CallError<io::Error> =
            CallError::Inner(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(err.source().unwrap().to_string(), "reset");

        let canceled: CallError<io::Error> = CallError::Canceled;
        assert!(canceled.source().is_none());
    }

    #[test]
    fn into_inner_covers_all_wrapping_variants() {
        assert_eq!(CallError::Inner(DummyError("a")).into_inner(), Some(DummyError("a")));
        assert_eq!(CallError::Opener(DummyError("b")).into_inner(), Some(DummyError("b")));
        assert_eq!(CallError::Unrecoverable(DummyError("c")).into_inner(), Some(DummyError("c")));
        assert_eq!(CallError::<DummyError>::Canceled.into_inner(), None);
    }

    #[derive(Debug)]
    struct Outer(RetryAfterError);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "outer")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn retry_after_found_through_source_chain() {
        let inner = RetryAfterError::new(Duration::from_millis(250), DummyError("throttled"));
        let outer = Outer(inner);
        assert_eq!(retry_after_of(&outer), Some(Duration::from_millis(250)));

        let wrapped: CallError<Outer> = CallError::Inner(Outer(RetryAfterError::new(
            Duration::from_millis(100),
            DummyError("throttled"),
        )));
        assert_eq!(wrapped.retry_after(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn zero_retry_after_is_ignored() {
        let err = RetryAfterError::new(Duration::ZERO, DummyError("throttled"));
        assert_eq!(retry_after_of(&err), None);
    }

    #[test]
    fn io_error_found_through_chain() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(io_error_of(&io_err).is_some());
        assert!(io_error_of(&DummyError("not io")).is_none());
    }
}
