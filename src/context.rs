//! Per-call context: cancellation plus ambient retry overrides.
//!
//! A [`CallContext`] is an explicit value the caller threads through a call
//! path instead of ambient global state. It carries a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) observed by the
//! retry engine's inter-attempt waits, and optional [`RetryOptions`] that
//! take precedence over whatever defaults the call site's policy was built
//! with. A wrapper several layers above the call site can tighten the attempt
//! budget or swap the filter chain for one request without rebuilding the
//! policy.

use crate::retry::FilterChain;
use crate::Backoff;
use tokio_util::sync::CancellationToken;

/// Per-call overrides for a [`RetryPolicy`](crate::RetryPolicy).
///
/// Fields left unset fall back to the policy's own configuration.
pub struct RetryOptions<E> {
    pub(crate) max_attempts: Option<usize>,
    pub(crate) backoff: Option<Backoff>,
    pub(crate) filters: Option<FilterChain<E>>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            filters: self.filters.clone(),
        }
    }
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RetryOptions<E> {
    pub fn new() -> Self {
        Self { max_attempts: None, backoff: None, filters: None }
    }

    /// Override the total attempt budget. Zero is treated as unset, since
    /// the policy itself never accepts a zero budget.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the delay schedule.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override the filter chain.
    pub fn filters(mut self, filters: FilterChain<E>) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// Cancellation and per-call options for one downstream call.
pub struct CallContext<E> {
    cancel: CancellationToken,
    retry_options: Option<RetryOptions<E>>,
}

impl<E> Clone for CallContext<E> {
    fn clone(&self) -> Self {
        Self { cancel: self.cancel.clone(), retry_options: self.retry_options.clone() }
    }
}

impl<E> CallContext<E> {
    /// A context that is never canceled and carries no overrides.
    pub fn new() -> Self {
        Self { cancel: CancellationToken::new(), retry_options: None }
    }

    /// Attach an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attach retry overrides that take precedence over policy defaults.
    pub fn with_retry_options(mut self, options: RetryOptions<E>) -> Self {
        self.retry_options = Some(options);
        self
    }

    /// The token observed by inter-attempt waits.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn retry_options(&self) -> Option<&RetryOptions<E>> {
        self.retry_options.as_ref()
    }
}

impl<E> Default for CallContext<E> {
    fn default() -> Self {
        Self::new()
    }
}
