//! Deserializable configuration for the pool and retry engine.
//!
//! These structs map one-to-one onto the sections a service puts in its
//! config file. Every field has a default, so an empty mapping is valid;
//! durations use human-friendly strings (`"250ms"`, `"5s"`). Validation is
//! separate from deserialization: a parsed config may still be rejected by
//! [`PoolConfig::validate`] or [`RetrySettings::build_policy`].

use crate::backoff::BackoffError;
use crate::error::Retryable;
use crate::retry::{filters, Filter, FilterChain, RetryBuildError, RetryPolicy};
use crate::Backoff;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Pool sizing and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle floor maintained by the background task. Zero disables it.
    pub min_connections: u32,
    /// Clients opened eagerly at construction.
    pub initial_connections: u32,
    /// Hard capacity: checked-out plus idle clients never exceed this.
    pub max_connections: u32,
    /// Per-connection socket timeout, passed through to openers.
    #[serde(with = "humantime_serde")]
    pub socket_timeout: Duration,
    /// How often the background task checks the idle floor.
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            initial_connections: 0,
            max_connections: 10,
            socket_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

/// Errors produced when validating pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolConfigError {
    #[error(
        "pool bounds must satisfy min <= init <= max \
         (got min_connections={min}, initial_connections={init}, max_connections={max})"
    )]
    InvalidBounds { min: u32, init: u32, max: u32 },
    #[error("max_connections must be > 0")]
    ZeroCapacity,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolConfigError> {
        if self.max_connections == 0 {
            return Err(PoolConfigError::ZeroCapacity);
        }
        if self.min_connections > self.initial_connections
            || self.initial_connections > self.max_connections
        {
            return Err(PoolConfigError::InvalidBounds {
                min: self.min_connections,
                init: self.initial_connections,
                max: self.max_connections,
            });
        }
        Ok(())
    }
}

/// Named standard filters, in the order they should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSpec {
    Cancellation,
    Network,
    PoolExhausted,
    CircuitOpen,
    Retryable,
}

impl FilterSpec {
    fn to_filter<E>(self) -> Filter<E>
    where
        E: Retryable + std::error::Error + Send + Sync + 'static,
    {
        match self {
            FilterSpec::Cancellation => filters::cancellation(),
            FilterSpec::Network => filters::network(),
            FilterSpec::PoolExhausted => filters::pool_exhausted(),
            FilterSpec::CircuitOpen => filters::circuit_open(),
            FilterSpec::Retryable => filters::retryable(),
        }
    }
}

/// Retry engine settings.
///
/// The defaults describe a single attempt with a 1ms initial delay and 5ms
/// of jitter, i.e. retrying is opt-in per call site.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, initial try included.
    pub attempts: usize,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Cap on the exponential schedule. Unset means uncapped (the schedule
    /// still stops doubling at the overflow-safe exponent).
    #[serde(with = "humantime_serde::option")]
    pub max_delay: Option<Duration>,
    /// Explicit cap on the doubling exponent; only lowers the derived one.
    pub max_exponent: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub max_jitter: Duration,
    /// Ignore downstream retry-after hints.
    pub ignore_retry_after: bool,
    /// Ordered filter chain. Empty means never retry.
    pub filters: Vec<FilterSpec>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: None,
            max_exponent: None,
            max_jitter: Duration::from_millis(5),
            ignore_retry_after: false,
            filters: Vec::new(),
        }
    }
}

/// Errors produced when turning [`RetrySettings`] into a policy.
#[derive(Debug, Error)]
pub enum RetryConfigError {
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
    #[error("invalid retry policy: {0}")]
    Policy(#[from] RetryBuildError),
}

impl RetrySettings {
    /// Build the backoff schedule these settings describe.
    pub fn build_backoff(&self) -> Result<Backoff, BackoffError> {
        let mut backoff = Backoff::exponential(self.initial_delay);
        if let Some(max) = self.max_delay {
            backoff = backoff.with_max(max)?;
        }
        if let Some(exp) = self.max_exponent {
            backoff = backoff.with_max_exponent(exp);
        }
        backoff = backoff.with_max_jitter(self.max_jitter);
        if self.ignore_retry_after {
            backoff = backoff.ignore_retry_after();
        }
        Ok(backoff)
    }

    /// Build a ready-to-use retry policy.
    ///
    /// Requires `E: Retryable` because the config may name the `retryable`
    /// filter; errors without an opinion just return `None` there.
    pub fn build_policy<E>(&self) -> Result<RetryPolicy<E>, RetryConfigError>
    where
        E: Retryable + std::error::Error + Send + Sync + 'static,
    {
        let chain = FilterChain::of(self.filters.iter().map(|f| f.to_filter::<E>()));
        let policy = RetryPolicy::builder()
            .max_attempts(self.attempts)
            .backoff(self.build_backoff()?)
            .filters(chain)
            .build()?;
        Ok(policy)
    }
}
