//! End-to-end tests of the pool → breaker → retry call path.

use downstream::{
    filters, opener, Backoff, BreakerConfig, BreakerState, CallContext, CallError, CircuitBreaker,
    FilterChain, InstantSleeper, ManagedClient, Opener, Pool, PoolConfig, RetryPolicy,
};
use futures::future::BoxFuture;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Conn {
    id: usize,
}

impl ManagedClient for Conn {
    type Error = io::Error;

    fn is_healthy(&self) -> bool {
        true
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), io::Error>> {
        Box::pin(async { Ok(()) })
    }
}

fn conn_opener() -> (Opener<Conn>, Arc<AtomicUsize>) {
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = opens.clone();
    let op = opener(move || {
        let id = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(Conn { id }) }
    });
    (op, opens)
}

fn pool_config(min: u32, init: u32, max: u32) -> PoolConfig {
    PoolConfig {
        min_connections: min,
        initial_connections: init,
        max_connections: max,
        maintenance_interval: Duration::from_secs(3600),
        ..PoolConfig::default()
    }
}

fn breaker(name: &str, min_requests: u64) -> CircuitBreaker {
    CircuitBreaker::new(BreakerConfig {
        name: name.into(),
        min_requests_to_trip: min_requests,
        failure_threshold: 0.5,
        timeout: Duration::from_secs(60),
        timeout_jitter_ratio: 0.0,
        ..BreakerConfig::default()
    })
    .expect("valid breaker config")
}

/// The classic composition: check a client out, call through the breaker,
/// release the client whatever happened, and let the retry engine drive the
/// whole sequence until the downstream recovers.
#[tokio::test]
async fn transient_downstream_failure_recovers_through_the_full_stack() {
    let (op, _) = conn_opener();
    let (pool, warmup) = Pool::new(pool_config(0, 1, 2), op).await.unwrap();
    assert!(warmup.is_none());

    let brk = breaker("backend", 10);
    let policy = RetryPolicy::<io::Error>::builder()
        .max_attempts(5)
        .backoff(Backoff::constant(Duration::from_millis(1)))
        .filters(FilterChain::of([
            filters::cancellation(),
            filters::pool_exhausted(),
            filters::circuit_open(),
            filters::network(),
        ]))
        .sleeper(InstantSleeper)
        .build()
        .unwrap();

    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let ctx = CallContext::new();

    let calls = downstream_calls.clone();
    let result = policy
        .execute(&ctx, || {
            let pool = pool.clone();
            let brk = brk.clone();
            let calls = calls.clone();
            async move {
                let client = pool.get().await?;
                let response = brk
                    .execute(|| async {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(CallError::Inner(io::Error::new(
                                io::ErrorKind::ConnectionReset,
                                "reset",
                            )))
                        } else {
                            Ok("payload")
                        }
                    })
                    .await;
                // The client goes back even when the call failed.
                let released = pool.release(client).await;
                match response {
                    Ok(value) => {
                        released?;
                        Ok(value)
                    }
                    Err(err) => {
                        let _ = released;
                        Err(err)
                    }
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "payload");
    assert_eq!(downstream_calls.load(Ordering::SeqCst), 3, "two failures, then success");
    assert_eq!(pool.num_active(), 0, "every attempt released its client");
    assert_eq!(brk.state(), BreakerState::Closed);
}

#[tokio::test]
async fn open_breaker_failures_aggregate_and_classify() {
    let brk = breaker("flaky", 1);
    // One failure trips it (1/1 >= 0.5).
    let _ = brk
        .execute(|| async {
            Err::<(), _>(CallError::Inner(io::Error::new(io::ErrorKind::Other, "down")))
        })
        .await;
    assert_eq!(brk.state(), BreakerState::Open);

    let policy = RetryPolicy::<io::Error>::builder()
        .max_attempts(3)
        .backoff(Backoff::constant(Duration::from_millis(1)))
        .filters(FilterChain::of([filters::circuit_open()]))
        .sleeper(InstantSleeper)
        .build()
        .unwrap();

    let wrapped_calls = Arc::new(AtomicUsize::new(0));
    let calls = wrapped_calls.clone();
    let err = policy
        .execute(&CallContext::new(), || {
            let brk = brk.clone();
            let calls = calls.clone();
            async move {
                brk.execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        })
        .await
        .unwrap_err();

    assert_eq!(wrapped_calls.load(Ordering::SeqCst), 0, "open breaker never ran the call");
    assert!(err.is_circuit_open(), "the aggregate answers for its constituents");
    match err {
        CallError::AttemptsExhausted { attempts, failures } => {
            assert_eq!(attempts, 3);
            assert!(failures.iter().all(CallError::is_circuit_open));
        }
        other => panic!("expected AttemptsExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn pool_exhaustion_is_retried_until_a_client_frees_up() {
    let (op, opens) = conn_opener();
    let (pool, _) = Pool::new(pool_config(0, 0, 1), op).await.unwrap();

    let holder = pool.get().await.unwrap();
    assert!(pool.is_exhausted());

    // Free the only slot a little later, from another task.
    let release_pool = pool.clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_pool.release(holder).await.unwrap();
    });

    let policy = RetryPolicy::<io::Error>::builder()
        .max_attempts(20)
        .backoff(Backoff::constant(Duration::from_millis(20)))
        .filters(FilterChain::of([filters::pool_exhausted()]))
        .build()
        .unwrap();

    let result = policy
        .execute(&CallContext::new(), || {
            let pool = pool.clone();
            async move {
                let client = pool.get().await?;
                let id = client.id;
                pool.release(client).await?;
                Ok(id)
            }
        })
        .await;

    releaser.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(opens.load(Ordering::SeqCst), 1, "the released client was reused");
    assert_eq!(pool.num_active(), 0);
}
