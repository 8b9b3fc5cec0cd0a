#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # downstream
//!
//! Client resilience primitives for calling unreliable downstream services:
//! a bounded connection [`Pool`], a [`RetryPolicy`] with overflow-safe capped
//! exponential [`Backoff`] and composable error-classification filters, and
//! a failure-ratio [`CircuitBreaker`]. The three compose into the classic
//! pool → breaker → retry call path.
//!
//! All three speak one error type, [`CallError`], so a single filter chain
//! can classify failures from any layer: retry on pool exhaustion or an open
//! breaker, stop on cancellation, and let the wrapped error's own
//! [`Retryable`] capability drive everything else.
//!
//! ## Quick start
//!
//! ```rust
//! use downstream::{
//!     filters, Backoff, BreakerConfig, CallContext, CallError, CircuitBreaker, FilterChain,
//!     RetryPolicy,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = CircuitBreaker::new(BreakerConfig {
//!         name: "downstream".into(),
//!         ..BreakerConfig::default()
//!     })
//!     .unwrap();
//!
//!     let policy = RetryPolicy::<std::io::Error>::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(50)))
//!         .filters(FilterChain::of([
//!             filters::circuit_open(),
//!             filters::network(),
//!             filters::cancellation(),
//!         ]))
//!         .build()
//!         .unwrap();
//!
//!     let ctx = CallContext::new();
//!     let result: Result<(), CallError<std::io::Error>> = policy
//!         .execute(&ctx, || breaker.execute(|| async { Ok(()) }))
//!         .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod retry;
pub mod sleeper;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{
    BreakerConfig, BreakerConfigError, BreakerState, CircuitBreaker, Clock, MonotonicClock,
};
pub use config::{FilterSpec, PoolConfig, PoolConfigError, RetryConfigError, RetrySettings};
pub use context::{CallContext, RetryOptions};
pub use error::{retry_after_of, CallError, RetryAfterError, Retryable};
pub use pool::{opener, ManagedClient, Opener, Pool, WarmupError};
pub use retry::{
    filters, Filter, FilterChain, RetryBuildError, RetryLayer, RetryPolicy, RetryPolicyBuilder,
    RetryService, Verdict,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
