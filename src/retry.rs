//! Retry engine for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - After each failing attempt the error runs through an ordered
//!   [`FilterChain`]; the first filter that returns a definitive
//!   [`Verdict`] wins, and a chain where every filter defers decides
//!   "do not retry". `CallError::Unrecoverable` short-circuits the chain
//!   entirely and is returned as-is.
//! - Before each retry (never before the first attempt) the delay schedule
//!   is consulted, a downstream retry-after hint may raise the delay, and
//!   the wait races the context's cancellation token: cancellation stops
//!   the call immediately with `CallError::Canceled`.
//! - When the budget is exhausted, every attempt's error is returned in an
//!   `AttemptsExhausted` aggregate whose length equals the attempts made.
//! - Options attached to the [`CallContext`] override the policy's own
//!   budget, schedule, and filters for that call.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use downstream::{filters, Backoff, CallContext, CallError, FilterChain, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<std::io::Error>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(1)))
//!     .filters(FilterChain::of([filters::cancellation(), filters::network()]))
//!     .build()
//!     .unwrap();
//! let ctx = CallContext::new();
//! let result: Result<(), _> = policy
//!     .execute(&ctx, || async {
//!         Err(CallError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::ConnectionReset,
//!             "reset",
//!         )))
//!     })
//!     .await;
//! assert!(result.is_err());
//! # });
//! ```

use crate::context::CallContext;
use crate::{Backoff, CallError, Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Decision produced by a single filter for one attempt's error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Retry, subject to the remaining attempt budget.
    Retry,
    /// Stop now and return this attempt's error.
    Stop,
    /// No opinion; defer to the next filter in the chain.
    Pass,
}

/// A single error-classification filter.
pub type Filter<E> = Arc<dyn Fn(&CallError<E>) -> Verdict + Send + Sync>;

/// Ordered chain of filters with first-decision-wins semantics.
///
/// An empty chain, or a chain where every filter passes, decides "do not
/// retry", which is the safe default for non-idempotent operations.
pub struct FilterChain<E> {
    filters: Arc<Vec<Filter<E>>>,
}

impl<E> Clone for FilterChain<E> {
    fn clone(&self) -> Self {
        Self { filters: self.filters.clone() }
    }
}

impl<E> Default for FilterChain<E> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<E> FilterChain<E> {
    /// A chain with no filters; never retries.
    pub fn empty() -> Self {
        Self { filters: Arc::new(Vec::new()) }
    }

    /// Build a chain from filters in evaluation order.
    pub fn of(filters: impl IntoIterator<Item = Filter<E>>) -> Self {
        Self { filters: Arc::new(filters.into_iter().collect()) }
    }

    /// Evaluate the chain: true means retry.
    pub fn decide(&self, err: &CallError<E>) -> bool {
        for filter in self.filters.iter() {
            match filter(err) {
                Verdict::Retry => return true,
                Verdict::Stop => return false,
                Verdict::Pass => continue,
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Standard filters. Each defers when the error is not its concern, so they
/// compose in any order; a typical chain for an idempotent call is
/// `[retryable, circuit_open, network, cancellation]`.
pub mod filters {
    use super::{Filter, Verdict};
    use crate::error::{io_error_of, Retryable};
    use crate::CallError;
    use std::sync::Arc;

    /// Never retry a canceled call.
    pub fn cancellation<E>() -> Filter<E> {
        Arc::new(|err: &CallError<E>| {
            if err.is_canceled() {
                Verdict::Stop
            } else {
                Verdict::Pass
            }
        })
    }

    /// Retry when the wrapped error carries an I/O error anywhere in its
    /// `source` chain. Only safe for idempotent operations.
    pub fn network<E>() -> Filter<E>
    where
        E: std::error::Error + 'static,
    {
        Arc::new(|err: &CallError<E>| match err.as_inner().and_then(|e| io_error_of(e)) {
            Some(_) => Verdict::Retry,
            None => Verdict::Pass,
        })
    }

    /// Retry when the error is, or aggregates, the pool's exhausted error.
    pub fn pool_exhausted<E>() -> Filter<E> {
        Arc::new(|err: &CallError<E>| {
            if err.is_pool_exhausted() {
                Verdict::Retry
            } else {
                Verdict::Pass
            }
        })
    }

    /// Retry when the error is, or aggregates, the breaker's fail-fast
    /// error. Pair with a non-zero backoff, or this busy-loops against an
    /// open breaker.
    pub fn circuit_open<E>() -> Filter<E> {
        Arc::new(|err: &CallError<E>| {
            if err.is_circuit_open() {
                Verdict::Retry
            } else {
                Verdict::Pass
            }
        })
    }

    /// Consult the error's own [`Retryable`] capability: yes retries, no
    /// stops, unknown defers.
    pub fn retryable<E: Retryable>() -> Filter<E> {
        Arc::new(|err: &CallError<E>| match err.as_inner().and_then(Retryable::retryable) {
            Some(true) => Verdict::Retry,
            Some(false) => Verdict::Stop,
            None => Verdict::Pass,
        })
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryBuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for RetryBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryBuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for RetryBuildError {}

/// Retry policy combining an attempt budget, delay schedule, filter chain,
/// and sleeper.
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    filters: FilterChain<E>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            filters: self.filters.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Run `operation` under this policy's retry semantics, honoring the
    /// context's cancellation token and per-call overrides.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &CallContext<E>,
        mut operation: Op,
    ) -> Result<T, CallError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, CallError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let options = ctx.retry_options();
        // A zero attempt override is never meaningful; ignore it and keep
        // the policy's own budget, which the builder guarantees is > 0.
        let max_attempts = options
            .and_then(|o| o.max_attempts)
            .filter(|attempts| *attempts > 0)
            .unwrap_or(self.max_attempts);
        let backoff = options.and_then(|o| o.backoff.as_ref()).unwrap_or(&self.backoff);
        let filters = options.and_then(|o| o.filters.as_ref()).unwrap_or(&self.filters);

        let mut failures: Vec<CallError<E>> = Vec::new();

        for attempt in 0..max_attempts {
            if ctx.is_canceled() {
                return Err(CallError::Canceled);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err @ CallError::Unrecoverable(_)) => return Err(err),
                Err(err) => {
                    if !filters.decide(&err) {
                        return Err(err);
                    }

                    if attempt + 1 >= max_attempts {
                        failures.push(err);
                        return Err(CallError::attempts_exhausted(failures));
                    }

                    let delay = backoff.delay(attempt, err.retry_after());
                    failures.push(err);

                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "attempt failed, retrying after delay"
                    );

                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => return Err(CallError::Canceled),
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }

        // Unreachable: the final loop iteration always returns.
        debug_assert!(false, "retry loop must return within max_attempts iterations");
        Err(CallError::attempts_exhausted(failures))
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    filters: FilterChain<E>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(1)),
            filters: FilterChain::empty(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay schedule applied before each retry.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Ordered error-classification filters.
    pub fn filters(mut self, filters: FilterChain<E>) -> Self {
        self.filters = filters;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            filters: self.filters,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer driving a [`RetryPolicy`] for `tower::Service` calls.
///
/// Service errors are converted into the policy's error type and wrapped in
/// `CallError::Inner` before classification, so the same filter chains work
/// for middleware stacks and direct `execute` calls.
pub struct RetryLayer<E> {
    policy: RetryPolicy<E>,
}

impl<E> RetryLayer<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self { policy }
    }
}

impl<E> Clone for RetryLayer<E> {
    fn clone(&self) -> Self {
        Self { policy: self.policy.clone() }
    }
}

impl<S, E> Layer<S> for RetryLayer<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    type Service = RetryService<S, E>;

    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, policy: self.policy.clone() }
    }
}

/// Retry service produced by [`RetryLayer`].
pub struct RetryService<S, E> {
    inner: S,
    policy: RetryPolicy<E>,
}

impl<S: Clone, E> Clone for RetryService<S, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), policy: self.policy.clone() }
    }
}

impl<S, E, Request> Service<Request> for RetryService<S, E>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<E> + Send + 'static,
    S::Future: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = CallError<E>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| CallError::Inner(e.into()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let policy = self.policy.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut failures: Vec<CallError<E>> = Vec::new();
            for attempt in 0..policy.max_attempts {
                match inner.call(req.clone()).await {
                    Ok(resp) => return Ok(resp),
                    Err(err) => {
                        let err = CallError::Inner(err.into());
                        if !policy.filters.decide(&err) {
                            return Err(err);
                        }
                        if attempt + 1 >= policy.max_attempts {
                            failures.push(err);
                            return Err(CallError::attempts_exhausted(failures));
                        }
                        let delay = policy.backoff.delay(attempt, err.retry_after());
                        failures.push(err);
                        policy.sleeper.sleep(delay).await;
                    }
                }
            }
            Err(CallError::attempts_exhausted(failures))
        })
    }
}
