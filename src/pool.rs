//! Bounded concurrent pool of reusable client handles.
//!
//! The pool holds idle clients in a bounded store and hands out ownership on
//! [`Pool::get`]; callers return clients with [`Pool::release`]. Capacity is
//! enforced so that checked-out plus idle clients never exceed
//! `max_connections`, even transiently. Health is checked on both checkout
//! and return: a dead client is closed and transparently replaced, so the
//! idle store never knowingly holds a broken handle.
//!
//! When `min_connections > 0` a background maintenance task periodically
//! tops the pool back up to the minimum, opening clients directly into the
//! idle store. Its opener failures are logged and swallowed; no caller is
//! waiting on them.
//!
//! Locking: the idle store and both counters are updated under one short
//! critical section that never spans an `.await`. The opener runs outside
//! the lock; capacity is reserved first so a slow opener cannot let the
//! pool oversubscribe.

use crate::config::PoolConfig;
use crate::CallError;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A poolable client handle.
///
/// `is_healthy` must be cheap; it runs on every checkout and return.
pub trait ManagedClient: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Liveness probe consulted before a client is reused or stored.
    fn is_healthy(&self) -> bool;

    /// Graceful close. The pool calls this at most once per client.
    fn close(&mut self) -> BoxFuture<'_, Result<(), Self::Error>>;
}

/// Factory the pool uses to open new clients.
pub type Opener<C> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<C, <C as ManagedClient>::Error>> + Send + Sync>;

/// Wrap an async closure as an [`Opener`].
pub fn opener<C, F, Fut>(f: F) -> Opener<C>
where
    C: ManagedClient,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, C::Error>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Partial warm-up failure: the pool was still constructed with whatever
/// opened successfully before the failing attempt.
#[derive(Debug, Error)]
#[error("warm-up stopped at client {attempt} of {requested}: {source}")]
pub struct WarmupError<E: std::error::Error + 'static> {
    /// Zero-based index of the failed open.
    pub attempt: usize,
    /// How many clients warm-up was asked to open.
    pub requested: usize,
    #[source]
    pub source: E,
}

struct PoolInner<C: ManagedClient> {
    idle: Mutex<VecDeque<C>>,
    active: AtomicI32,
    allocated: AtomicI32,
    min: i32,
    max: i32,
    opener: Opener<C>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ManagedClient> PoolInner<C> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<C>> {
        self.idle.lock().expect("pool idle lock poisoned")
    }

    fn exhausted_error<E>(&self) -> CallError<E> {
        CallError::PoolExhausted { active: self.active.load(Ordering::Acquire), max: self.max }
    }

    async fn close_quietly(&self, mut client: C) {
        if let Err(err) = client.close().await {
            tracing::debug!(error = %err, "error closing pooled client");
        }
    }

    /// Open clients into the idle store until the pool holds at least `min`
    /// clients. Opener failures end the pass; the next tick tries again.
    async fn top_up(&self) {
        loop {
            {
                let idle = self.idle();
                let total = self.active.load(Ordering::Acquire) + idle.len() as i32;
                if self.closed.load(Ordering::Acquire) || total >= self.min {
                    return;
                }
            }
            match (self.opener)().await {
                Ok(client) => {
                    let rejected = {
                        let mut idle = self.idle();
                        let total = self.active.load(Ordering::Acquire) + idle.len() as i32;
                        if self.closed.load(Ordering::Acquire) || total >= self.max {
                            Some(client)
                        } else {
                            idle.push_back(client);
                            self.allocated.fetch_add(1, Ordering::AcqRel);
                            None
                        }
                    };
                    if let Some(client) = rejected {
                        self.close_quietly(client).await;
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "maintenance open failed; will retry next tick");
                    return;
                }
            }
        }
    }
}

/// Bounded pool of [`ManagedClient`]s with background minimum maintenance.
///
/// Cloning is cheap and shares the same pool.
pub struct Pool<C: ManagedClient> {
    inner: Arc<PoolInner<C>>,
}

impl<C: ManagedClient> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: ManagedClient> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("active", &self.num_active())
            .field("allocated", &self.num_allocated())
            .field("max", &self.inner.max)
            .finish()
    }
}

impl<C: ManagedClient> Pool<C> {
    /// Construct a pool and eagerly open `initial_connections` clients.
    ///
    /// Configuration violations fail construction. A warm-up opener failure
    /// does not: the pool is returned with whatever opened successfully,
    /// alongside a [`WarmupError`] naming the attempt that failed, and the
    /// caller decides whether a partially warm pool is acceptable.
    pub async fn new(
        config: PoolConfig,
        opener: Opener<C>,
    ) -> Result<(Self, Option<WarmupError<C::Error>>), crate::config::PoolConfigError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            idle: Mutex::new(VecDeque::with_capacity(config.max_connections as usize)),
            active: AtomicI32::new(0),
            allocated: AtomicI32::new(0),
            min: config.min_connections as i32,
            max: config.max_connections as i32,
            opener,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        });

        let requested = config.initial_connections as usize;
        let mut warmup = None;
        for attempt in 0..requested {
            match (inner.opener)().await {
                Ok(client) => {
                    inner.idle().push_back(client);
                    inner.allocated.fetch_add(1, Ordering::AcqRel);
                }
                Err(source) => {
                    warmup = Some(WarmupError { attempt, requested, source });
                    break;
                }
            }
        }

        if config.min_connections > 0 {
            let task_inner = inner.clone();
            let interval = config.maintenance_interval;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; skip it so construction
                // alone (with init < min) does not race the warm-up result.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = task_inner.shutdown.cancelled() => break,
                        _ = ticker.tick() => task_inner.top_up().await,
                    }
                }
            });
            *inner.maintenance.lock().expect("pool maintenance lock poisoned") = Some(handle);
        }

        Ok((Self { inner }, warmup))
    }

    /// Check a client out of the pool.
    ///
    /// Prefers an idle client; a dead idle client is closed and replaced
    /// transparently. With no idle client available, opens a new one if
    /// capacity allows, otherwise fails with the exhaustion error.
    pub async fn get(&self) -> Result<C, CallError<C::Error>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(inner.exhausted_error());
        }

        let popped = {
            let mut idle = inner.idle();
            match idle.pop_front() {
                Some(client) => {
                    // The slot moves from idle to active while the lock is
                    // held, so the capacity invariant holds mid-substitution.
                    inner.allocated.fetch_sub(1, Ordering::AcqRel);
                    inner.active.fetch_add(1, Ordering::AcqRel);
                    Some(client)
                }
                None => {
                    let active = inner.active.load(Ordering::Acquire);
                    if active >= inner.max {
                        return Err(CallError::PoolExhausted { active, max: inner.max });
                    }
                    inner.active.fetch_add(1, Ordering::AcqRel);
                    None
                }
            }
        };

        match popped {
            Some(client) if client.is_healthy() => Ok(client),
            Some(dead) => {
                tracing::debug!("idle client failed health check; replacing");
                inner.close_quietly(dead).await;
                match (inner.opener)().await {
                    Ok(fresh) => Ok(fresh),
                    Err(err) => {
                        inner.active.fetch_sub(1, Ordering::AcqRel);
                        Err(CallError::Opener(err))
                    }
                }
            }
            None => match (inner.opener)().await {
                Ok(fresh) => Ok(fresh),
                Err(err) => {
                    inner.active.fetch_sub(1, Ordering::AcqRel);
                    Err(CallError::Opener(err))
                }
            },
        }
    }

    /// Return a client to the pool.
    ///
    /// A dead client is closed and replaced with a fresh one before being
    /// stored; the opener failure, if any, is surfaced. A client that does
    /// not fit the idle store is closed instead of stored, which is not an
    /// error. The active count drops exactly once either way.
    pub async fn release(&self, client: C) -> Result<(), CallError<C::Error>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            inner.close_quietly(client).await;
            inner.active.fetch_sub(1, Ordering::AcqRel);
            return Err(inner.exhausted_error());
        }

        let client = if client.is_healthy() {
            client
        } else {
            tracing::debug!("released client failed health check; replacing");
            inner.close_quietly(client).await;
            match (inner.opener)().await {
                Ok(fresh) => fresh,
                Err(err) => {
                    inner.active.fetch_sub(1, Ordering::AcqRel);
                    return Err(CallError::Opener(err));
                }
            }
        };

        let stored = {
            let mut idle = inner.idle();
            // Re-check under the lock: a concurrent close() has already
            // drained the store, so the client must be closed, not parked.
            if !inner.closed.load(Ordering::Acquire) && (idle.len() as i32) < inner.max {
                idle.push_back(client);
                inner.allocated.fetch_add(1, Ordering::AcqRel);
                inner.active.fetch_sub(1, Ordering::AcqRel);
                None
            } else {
                Some(client)
            }
        };

        if let Some(overflow) = stored {
            inner.close_quietly(overflow).await;
            inner.active.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Shut the pool down: stop maintenance, drain and close every idle
    /// client. Returns the last close error encountered. Idempotent; a
    /// second call is a no-op.
    pub async fn close(&self) -> Result<(), C::Error> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.shutdown.cancel();

        let maintenance = inner
            .maintenance
            .lock()
            .expect("pool maintenance lock poisoned")
            .take();
        if let Some(handle) = maintenance {
            let _ = handle.await;
        }

        let drained: Vec<C> = {
            let mut idle = inner.idle();
            inner.allocated.store(0, Ordering::Release);
            idle.drain(..).collect()
        };

        let mut last_err = None;
        for mut client in drained {
            if let Err(err) = client.close().await {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clients currently checked out.
    pub fn num_active(&self) -> i32 {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Clients currently idle inside the pool.
    pub fn num_allocated(&self) -> i32 {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// True once every capacity slot is checked out.
    pub fn is_exhausted(&self) -> bool {
        self.num_active() >= self.inner.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct TestClient {
        id: usize,
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl ManagedClient for TestClient {
        type Error = io::Error;

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }

        fn close(&mut self) -> BoxFuture<'_, Result<(), io::Error>> {
            self.closed.store(true, Ordering::Release);
            Box::pin(async { Ok(()) })
        }
    }

    struct Factory {
        opens: Arc<AtomicUsize>,
        fail_from: Option<usize>,
        clients: Arc<Mutex<Vec<(Arc<AtomicBool>, Arc<AtomicBool>)>>>,
    }

    impl Factory {
        fn new() -> Self {
            Self {
                opens: Arc::new(AtomicUsize::new(0)),
                fail_from: None,
                clients: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing_from(mut self, n: usize) -> Self {
            self.fail_from = Some(n);
            self
        }

        fn opener(&self) -> Opener<TestClient> {
            let opens = self.opens.clone();
            let fail_from = self.fail_from;
            let clients = self.clients.clone();
            opener(move || {
                let n = opens.fetch_add(1, Ordering::SeqCst);
                let clients = clients.clone();
                async move {
                    if fail_from.is_some_and(|f| n >= f) {
                        return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
                    }
                    let healthy = Arc::new(AtomicBool::new(true));
                    let closed = Arc::new(AtomicBool::new(false));
                    clients
                        .lock()
                        .unwrap()
                        .push((healthy.clone(), closed.clone()));
                    Ok(TestClient { id: n, healthy, closed })
                }
            })
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn client_closed(&self, n: usize) -> bool {
            self.clients.lock().unwrap()[n].1.load(Ordering::Acquire)
        }
    }

    fn config(min: u32, init: u32, max: u32) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            initial_connections: init,
            max_connections: max,
            // Long enough that maintenance never fires mid-test.
            maintenance_interval: Duration::from_secs(3600),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn capacity_invariant_holds_across_get_and_release() {
        let factory = Factory::new();
        let (pool, warmup) = Pool::new(config(0, 2, 3), factory.opener()).await.unwrap();
        assert!(warmup.is_none());

        let check = |pool: &Pool<TestClient>| {
            assert!(pool.num_active() + pool.num_allocated() <= 3);
        };

        let a = pool.get().await.unwrap();
        check(&pool);
        let b = pool.get().await.unwrap();
        check(&pool);
        let c = pool.get().await.unwrap();
        check(&pool);
        pool.release(a).await.unwrap();
        check(&pool);
        let d = pool.get().await.unwrap();
        check(&pool);
        pool.release(b).await.unwrap();
        pool.release(c).await.unwrap();
        pool.release(d).await.unwrap();
        check(&pool);
        assert_eq!(pool.num_active(), 0);
    }

    #[tokio::test]
    async fn exhausted_pool_rejects_without_calling_opener() {
        let factory = Factory::new();
        let (pool, _) = Pool::new(config(0, 0, 2), factory.opener()).await.unwrap();

        let _a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        assert!(pool.is_exhausted());
        let opens_before = factory.open_count();

        let err = pool.get().await.unwrap_err();
        assert_eq!(err.pool_occupancy(), Some((2, 2)));
        assert_eq!(factory.open_count(), opens_before, "no opener call when exhausted");
    }

    #[tokio::test]
    async fn dead_release_closes_original_and_opens_exactly_one_replacement() {
        let factory = Factory::new();
        let (pool, _) = Pool::new(config(0, 0, 2), factory.opener()).await.unwrap();

        let client = pool.get().await.unwrap();
        let id = client.id;
        client.healthy.store(false, Ordering::Release);
        let opens_before = factory.open_count();

        pool.release(client).await.unwrap();
        assert_eq!(factory.open_count(), opens_before + 1);
        assert!(factory.client_closed(id), "dead client must be closed");
        assert_eq!(pool.num_allocated(), 1);
        assert_eq!(pool.num_active(), 0);
    }

    #[tokio::test]
    async fn dead_idle_client_is_replaced_transparently_on_get() {
        let factory = Factory::new();
        let (pool, _) = Pool::new(config(0, 1, 2), factory.opener()).await.unwrap();

        // Kill the idle client while it sits in the pool.
        factory.clients.lock().unwrap()[0].0.store(false, Ordering::Release);
        let opens_before = factory.open_count();

        let client = pool.get().await.unwrap();
        assert!(client.is_healthy());
        assert_eq!(factory.open_count(), opens_before + 1);
        assert!(factory.client_closed(0));
        assert_eq!(pool.num_active(), 1);
        assert_eq!(pool.num_allocated(), 0);
    }

    #[tokio::test]
    async fn opener_failure_on_release_still_drops_active_exactly_once() {
        let factory = Factory::new().failing_from(1);
        let (pool, _) = Pool::new(config(0, 0, 2), factory.opener()).await.unwrap();

        let client = pool.get().await.unwrap();
        client.healthy.store(false, Ordering::Release);
        let err = pool.release(client).await.unwrap_err();
        assert!(matches!(err, CallError::Opener(_)));
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_allocated(), 0);
    }

    #[tokio::test]
    async fn partial_warmup_returns_pool_and_names_failed_attempt() {
        let factory = Factory::new().failing_from(1);
        let (pool, warmup) = Pool::new(config(0, 3, 3), factory.opener()).await.unwrap();

        let warmup = warmup.expect("second open must fail");
        assert_eq!(warmup.attempt, 1);
        assert_eq!(warmup.requested, 3);
        assert_eq!(pool.num_allocated(), 1, "first client survives warm-up failure");
    }

    #[tokio::test]
    async fn invalid_bounds_fail_construction() {
        let factory = Factory::new();
        let err = Pool::new(config(3, 2, 1), factory.opener()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('3') && msg.contains('1'), "error names offending values: {msg}");
    }

    #[tokio::test]
    async fn end_to_end_capacity_walk() {
        let factory = Factory::new();
        let (pool, _) = Pool::new(config(1, 2, 3), factory.opener()).await.unwrap();

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let c = pool.get().await.unwrap();
        let ids = [a.id, b.id, c.id];
        assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), 3);
        assert_eq!(pool.num_active(), 3);
        assert!(pool.is_exhausted());

        assert!(pool.get().await.unwrap_err().is_pool_exhausted());

        pool.release(a).await.unwrap();
        assert_eq!(pool.num_active(), 2);
        assert_eq!(pool.num_allocated(), 1);

        pool.close().await.unwrap();
        assert_eq!(pool.num_allocated(), 0);
        assert!(
            factory.clients.lock().unwrap().iter().any(|(_, closed)| closed.load(Ordering::Acquire)),
            "the idle client is closed on shutdown"
        );

        // Outstanding clients released after close get the safe error, and
        // their handles are closed rather than leaked.
        let (b_id, c_id) = (b.id, c.id);
        assert!(pool.release(b).await.unwrap_err().is_pool_exhausted());
        assert!(pool.release(c).await.unwrap_err().is_pool_exhausted());
        assert!(factory.client_closed(b_id), "release after close must close the handle");
        assert!(factory.client_closed(c_id), "release after close must close the handle");
        assert!(pool.get().await.unwrap_err().is_pool_exhausted());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let factory = Factory::new();
        let (pool, _) = Pool::new(config(0, 1, 2), factory.opener()).await.unwrap();
        pool.close().await.unwrap();
        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_tops_up_to_minimum() {
        let factory = Factory::new();
        let cfg = PoolConfig {
            min_connections: 2,
            initial_connections: 0,
            max_connections: 3,
            maintenance_interval: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let (pool, _) = Pool::new(cfg, factory.opener()).await.unwrap();
        assert_eq!(pool.num_allocated(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.num_allocated(), 2, "topped up to min_connections");
        assert_eq!(factory.open_count(), 2);

        pool.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_swallows_opener_failures() {
        let factory = Factory::new().failing_from(0);
        let cfg = PoolConfig {
            min_connections: 2,
            initial_connections: 0,
            max_connections: 3,
            maintenance_interval: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let (pool, _) = Pool::new(cfg, factory.opener()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.num_allocated(), 0, "failures are swallowed, not stored");
        pool.close().await.unwrap();
    }
}
