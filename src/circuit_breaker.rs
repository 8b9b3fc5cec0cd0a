//! Failure-ratio circuit breaker.
//!
//! The breaker cycles Closed → Open → HalfOpen → Closed forever. While
//! Closed it counts requests and failures, resetting the window every
//! `interval` (0 = never); once `min_requests_to_trip` requests have been
//! seen and the failure ratio reaches `failure_threshold`, it opens. While
//! Open every call fails fast with `CallError::CircuitOpen` until a jittered
//! `timeout` elapses, after which up to `max_requests_half_open` concurrent
//! probe calls are admitted: that many consecutive successes close the
//! breaker, any failure reopens it.
//!
//! The counters and state live behind one mutex whose critical section never
//! includes the wrapped call itself. Each window and state carries a
//! generation number; a call that finishes after the window it started in
//! has rolled over is not counted against the new window.

use crate::CallError;
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Millisecond time source for the breaker's interval and timeout deadlines.
///
/// The breaker compares deadlines against `now_millis()` rather than holding
/// `Instant`s, so tests can inject a hand-advanced clock via
/// [`CircuitBreaker::with_clock`].
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Default clock: milliseconds elapsed since the breaker's process started.
///
/// Windows do not survive restarts, which is fine for a breaker; a restarted
/// process starts Closed with fresh counts anyway.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operating mode; counting failures.
    Closed,
    /// Failing fast until the recovery timeout elapses.
    Open,
    /// Probe mode admitting a limited number of recovery test calls.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker configuration.
///
/// Deserializable so a breaker can be described in a service's config file;
/// every field has a default, so an empty mapping is a valid (if generic)
/// breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Label used in errors, callbacks, and gauge reports.
    pub name: String,
    /// Minimum requests in the current window before the ratio is evaluated.
    pub min_requests_to_trip: u64,
    /// Failure ratio in (0, 1] at which the breaker opens.
    pub failure_threshold: f64,
    /// Concurrent probe calls admitted while half-open; that many
    /// consecutive successes close the breaker.
    pub max_requests_half_open: u64,
    /// Closed-state counter reset period. Zero means never reset.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long to stay open before probing, before jitter.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Randomizes each open period to `timeout * (1 ± ratio)`, spreading
    /// recovery probes from many processes over time. Must be in [0, 1].
    pub timeout_jitter_ratio: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            min_requests_to_trip: 5,
            failure_threshold: 0.5,
            max_requests_half_open: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
            timeout_jitter_ratio: 0.5,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerConfigError {
    /// Failure threshold must be in (0, 1].
    InvalidFailureThreshold(f64),
    /// Minimum request count must be > 0.
    InvalidMinRequests(u64),
    /// Half-open probe limit must be > 0.
    InvalidHalfOpenLimit(u64),
    /// Open-state timeout must be > 0.
    InvalidTimeout(Duration),
    /// Jitter ratio must be in [0, 1].
    InvalidJitterRatio(f64),
}

impl std::fmt::Display for BreakerConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerConfigError::InvalidFailureThreshold(v) => {
                write!(f, "failure_threshold must be in (0, 1] (got {})", v)
            }
            BreakerConfigError::InvalidMinRequests(v) => {
                write!(f, "min_requests_to_trip must be > 0 (got {})", v)
            }
            BreakerConfigError::InvalidHalfOpenLimit(v) => {
                write!(f, "max_requests_half_open must be > 0 (got {})", v)
            }
            BreakerConfigError::InvalidTimeout(v) => {
                write!(f, "timeout must be > 0 (got {:?})", v)
            }
            BreakerConfigError::InvalidJitterRatio(v) => {
                write!(f, "timeout_jitter_ratio must be in [0, 1] (got {})", v)
            }
        }
    }
}

impl std::error::Error for BreakerConfigError {}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u64,
    total_failures: u64,
    consecutive_successes: u64,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// Closed: next interval rollover; Open: half-open admission time.
    /// Zero means no deadline.
    expiry_millis: u64,
    half_open_in_flight: u64,
}

type StateChangeHook = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Circuit breaker guarding an async operation.
///
/// Clones share the same underlying state, so all handles observe and affect
/// the same circuit lifecycle.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<BreakerConfig>,
    core: Arc<Mutex<BreakerCore>>,
    clock: Arc<dyn Clock>,
    on_state_change: Option<StateChangeHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut core = self.breaker.lock_core();
            // A generation bump resets the in-flight counter, so a stale
            // guard must not touch it.
            if core.generation == self.generation {
                core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker from a validated configuration.
    ///
    /// # Examples
    /// ```
    /// use downstream::{BreakerConfig, CircuitBreaker};
    /// let breaker = CircuitBreaker::new(BreakerConfig {
    ///     name: "redis".into(),
    ///     ..BreakerConfig::default()
    /// })
    /// .unwrap();
    /// ```
    pub fn new(config: BreakerConfig) -> Result<Self, BreakerConfigError> {
        Self::validate_config(&config)?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        let expiry = if config.interval.is_zero() {
            0
        } else {
            now.saturating_add(duration_millis(config.interval))
        };
        Ok(Self {
            config: Arc::new(config),
            core: Arc::new(Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry_millis: expiry,
                half_open_in_flight: 0,
            })),
            clock,
            on_state_change: None,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register a hook fired on every state transition with
    /// `(name, from, to)`.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, BreakerState, BreakerState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    fn validate_config(config: &BreakerConfig) -> Result<(), BreakerConfigError> {
        if !(config.failure_threshold > 0.0 && config.failure_threshold <= 1.0) {
            return Err(BreakerConfigError::InvalidFailureThreshold(config.failure_threshold));
        }
        if config.min_requests_to_trip == 0 {
            return Err(BreakerConfigError::InvalidMinRequests(0));
        }
        if config.max_requests_half_open == 0 {
            return Err(BreakerConfigError::InvalidHalfOpenLimit(0));
        }
        if config.timeout.is_zero() {
            return Err(BreakerConfigError::InvalidTimeout(config.timeout));
        }
        if !(0.0..=1.0).contains(&config.timeout_jitter_ratio) {
            return Err(BreakerConfigError::InvalidJitterRatio(config.timeout_jitter_ratio));
        }
        Ok(())
    }

    /// Execute `operation` under breaker protection.
    ///
    /// Open state rejects the call with `CallError::CircuitOpen` without
    /// running it; so does exceeding the half-open probe budget. Any other
    /// outcome runs the operation and records its success or failure.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, CallError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, CallError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let (generation, armed) = self.before_call()?;
        let guard = ProbeGuard { breaker: self, generation, armed };

        let result = operation().await;
        self.after_call(generation, result.is_ok());
        drop(guard);
        result
    }

    /// Current state, applying any pending timeout or interval rollover.
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now_millis();
        let (state, fired) = {
            let mut core = self.lock_core();
            let fired = self.sync(&mut core, now);
            (core.state, fired)
        };
        if let Some((from, to)) = fired {
            self.notify(from, to);
        }
        state
    }

    /// Gauge value for external reporting: 1 when calls are being admitted
    /// (Closed or HalfOpen), 0 when failing fast (Open).
    pub fn gauge(&self) -> u8 {
        match self.state() {
            BreakerState::Open => 0,
            _ => 1,
        }
    }

    /// Spawn a task reporting [`gauge`](Self::gauge) every `interval` until
    /// `shutdown` is canceled.
    pub fn spawn_gauge_reporter<F>(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
        report: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&str, u8) + Send + Sync + 'static,
    {
        let breaker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => report(&breaker.config.name, breaker.gauge()),
                }
            }
        })
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().expect("breaker lock poisoned")
    }

    fn before_call<E>(&self) -> Result<(u64, bool), CallError<E>> {
        let now = self.clock.now_millis();
        let (outcome, fired) = {
            let mut core = self.lock_core();
            let fired = self.sync(&mut core, now);
            let outcome = match core.state {
                BreakerState::Open => {
                    Err(CallError::CircuitOpen { name: self.config.name.clone() })
                }
                BreakerState::HalfOpen => {
                    if core.half_open_in_flight >= self.config.max_requests_half_open {
                        Err(CallError::CircuitOpen { name: self.config.name.clone() })
                    } else {
                        core.half_open_in_flight += 1;
                        core.counts.requests += 1;
                        Ok((core.generation, true))
                    }
                }
                BreakerState::Closed => {
                    core.counts.requests += 1;
                    Ok((core.generation, false))
                }
            };
            (outcome, fired)
        };
        if let Some((from, to)) = fired {
            self.notify(from, to);
        }
        outcome
    }

    fn after_call(&self, generation: u64, success: bool) {
        let now = self.clock.now_millis();
        let mut fired = Vec::new();
        {
            let mut core = self.lock_core();
            if let Some(t) = self.sync(&mut core, now) {
                fired.push(t);
            }
            if core.generation == generation {
                let transition = if success {
                    self.on_success(&mut core, now)
                } else {
                    self.on_failure(&mut core, now)
                };
                if let Some(t) = transition {
                    fired.push(t);
                }
            }
        }
        for (from, to) in fired {
            self.notify(from, to);
        }
    }

    fn on_success(&self, core: &mut BreakerCore, now: u64) -> Option<(BreakerState, BreakerState)> {
        match core.state {
            BreakerState::HalfOpen => {
                core.counts.consecutive_successes += 1;
                if core.counts.consecutive_successes >= self.config.max_requests_half_open {
                    return Some(self.transition(core, BreakerState::Closed, now));
                }
                None
            }
            _ => None,
        }
    }

    fn on_failure(&self, core: &mut BreakerCore, now: u64) -> Option<(BreakerState, BreakerState)> {
        core.counts.total_failures += 1;
        core.counts.consecutive_successes = 0;
        match core.state {
            BreakerState::Closed => {
                let requests = core.counts.requests;
                let failures = core.counts.total_failures;
                if requests >= self.config.min_requests_to_trip
                    && failures as f64 / requests as f64 >= self.config.failure_threshold
                {
                    return Some(self.transition(core, BreakerState::Open, now));
                }
                None
            }
            BreakerState::HalfOpen => Some(self.transition(core, BreakerState::Open, now)),
            BreakerState::Open => None,
        }
    }

    /// Apply lazy rollovers: Open whose timeout expired becomes HalfOpen,
    /// and a Closed window past its interval starts a fresh generation.
    fn sync(&self, core: &mut BreakerCore, now: u64) -> Option<(BreakerState, BreakerState)> {
        match core.state {
            BreakerState::Open if now >= core.expiry_millis => {
                Some(self.transition(core, BreakerState::HalfOpen, now))
            }
            BreakerState::Closed
                if core.expiry_millis != 0 && now >= core.expiry_millis =>
            {
                core.generation += 1;
                core.counts = Counts::default();
                core.expiry_millis = now.saturating_add(duration_millis(self.config.interval));
                None
            }
            _ => None,
        }
    }

    fn transition(
        &self,
        core: &mut BreakerCore,
        to: BreakerState,
        now: u64,
    ) -> (BreakerState, BreakerState) {
        let from = core.state;
        core.state = to;
        core.generation += 1;
        core.counts = Counts::default();
        core.half_open_in_flight = 0;
        core.expiry_millis = match to {
            BreakerState::Open => now.saturating_add(self.jittered_timeout_millis()),
            BreakerState::Closed if !self.config.interval.is_zero() => {
                now.saturating_add(duration_millis(self.config.interval))
            }
            _ => 0,
        };
        tracing::info!(
            breaker = %self.config.name,
            from = %from,
            to = %to,
            "circuit breaker state change"
        );
        (from, to)
    }

    fn jittered_timeout_millis(&self) -> u64 {
        use rand::Rng;
        let base = duration_millis(self.config.timeout) as f64;
        let ratio = self.config.timeout_jitter_ratio;
        let factor = if ratio > 0.0 {
            1.0 + ratio * rand::rng().random_range(-1.0..1.0)
        } else {
            1.0
        };
        (base * factor).max(1.0) as u64
    }

    fn notify(&self, from: BreakerState, to: BreakerState) {
        if let Some(hook) = &self.on_state_change {
            hook(&self.config.name, from, to);
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
