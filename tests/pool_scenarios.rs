use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use respool::{BoxError, Hook, PoolConfiguration, PoolError, PoolObject, PoolRegistry, ResourcePool, task_scope};

#[derive(Debug)]
struct Session {
    serial: usize,
    restores: Arc<AtomicUsize>,
}

#[async_trait]
impl PoolObject for Session {
    async fn object_restore(&mut self) -> Result<(), BoxError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn session_pool(config: PoolConfiguration, restores: &Arc<AtomicUsize>) -> ResourcePool<Session> {
    let serial = Arc::new(AtomicUsize::new(0));
    let restores = Arc::clone(restores);
    ResourcePool::new(
        move || {
            let serial = serial.fetch_add(1, Ordering::SeqCst);
            let restores = Arc::clone(&restores);
            async move { Ok::<_, Infallible>(Session { serial, restores }) }
        },
        config,
    )
    .unwrap()
}

#[tokio::test]
async fn third_acquire_waits_for_release() {
    let restores = Arc::new(AtomicUsize::new(0));
    let config = PoolConfiguration::new()
        .with_min_size(1)
        .with_max_size(2)
        .with_acquire_timeout(Duration::from_millis(100));
    let pool = session_pool(config, &restores);

    let first = pool.acquire().await.unwrap().expect("first acquire");
    let second = pool.acquire().await.unwrap().expect("second acquire");
    assert_ne!(first.identity(), second.identity());

    assert!(pool.acquire().await.unwrap().is_none());
    assert_eq!(pool.metrics().pool_empty_events, 1);

    let released = first.identity();
    assert!(pool.release(first).await.unwrap());

    let third = pool.acquire().await.unwrap().expect("third acquire");
    assert_eq!(third.identity(), released);
    assert_eq!(pool.status().created, 2);
}

#[tokio::test]
async fn waiter_is_woken_by_release() {
    let restores = Arc::new(AtomicUsize::new(0));
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(1)
        .with_acquire_timeout(Duration::from_secs(5))
        .without_maintenance();
    let pool = session_pool(config, &restores);

    let held = pool.acquire().await.unwrap().unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.unwrap().map(|s| s.serial) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.release(held).await.unwrap();

    let serial = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(serial, Some(0));
}

#[tokio::test]
async fn acquire_survives_two_factory_failures() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let factory = {
        let attempts = Arc::clone(&attempts);
        move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    return Err::<Session, BoxError>(format!("connect attempt {attempt} refused").into());
                }
                Ok(Session {
                    serial: attempt,
                    restores: Arc::new(AtomicUsize::new(0)),
                })
            }
        }
    };
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(2)
        .without_maintenance();
    let pool = ResourcePool::new(factory, config).unwrap();

    let session = pool.acquire_with(None, 3).await.unwrap().expect("session");
    assert_eq!(session.serial, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(pool.status().created, 1);
    assert_eq!(pool.metrics().creation_failures, 2);
}

#[tokio::test]
async fn creation_error_surfaces_once_retries_run_out() {
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(2)
        .without_maintenance();
    let pool = ResourcePool::new(|| async { Err::<Session, BoxError>("refused".into()) }, config).unwrap();

    let err = pool.acquire_with(None, 1).await.unwrap_err();
    assert!(matches!(err, PoolError::Creation(_)));
    assert_eq!(err.to_string(), "failed to create pool object: refused");
    assert_eq!(pool.status().created, 0);
}

#[tokio::test]
async fn scoped_object_released_once_per_task() {
    let restores = Arc::new(AtomicUsize::new(0));
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(3)
        .without_maintenance();
    let pool = session_pool(config, &restores);

    task_scope(async {
        let a = pool.with_scoped(None).await.unwrap();
        let b = pool.with_scoped(None).await.unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.lock().await.unwrap().serial, b.lock().await.unwrap().serial);
    })
    .await;

    assert_eq!(restores.load(Ordering::SeqCst), 1);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.status().created, 1);
}

#[tokio::test]
async fn shutdown_drains_after_outstanding_returns() {
    let restores = Arc::new(AtomicUsize::new(0));
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(3)
        .without_maintenance();
    let pool = session_pool(config, &restores);

    let held = pool.acquire().await.unwrap().unwrap();
    let queued = pool.acquire().await.unwrap().unwrap();
    pool.release(queued).await.unwrap();

    pool.shutdown().await;
    assert!(pool.acquire().await.unwrap().is_none());
    assert_eq!(pool.status().created, 1);

    drop(held);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.status().created, 0);
}

struct Flaky;

#[async_trait]
impl PoolObject for Flaky {
    async fn before_use(&mut self) -> Result<bool, BoxError> {
        Err("handshake failed".into())
    }
}

#[tokio::test]
async fn failing_hook_never_leaks_a_slot() {
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(1)
        .without_maintenance();
    let pool = ResourcePool::new(|| async { Ok::<_, Infallible>(Flaky) }, config).unwrap();

    let err = pool.acquire_with(None, 2).await.unwrap_err();
    assert!(matches!(err, PoolError::Hook { hook: Hook::BeforeUse, .. }));
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.metrics().total_created, 3);
    assert_eq!(pool.metrics().hook_failures, 3);
}

#[tokio::test]
async fn registry_serves_pools_by_name() {
    let restores = Arc::new(AtomicUsize::new(0));
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(2)
        .without_maintenance();
    let registry = PoolRegistry::new();
    registry.register("sessions", session_pool(config, &restores));

    let serial = registry
        .invoke::<Session, _, PoolError, _>("sessions", None, |session| {
            Box::pin(async move { Ok(session.serial) })
        })
        .await
        .unwrap();
    assert_eq!(serial, 0);
    assert_eq!(restores.load(Ordering::SeqCst), 1);

    assert!(matches!(
        registry.get::<Session>("missing"),
        Err(PoolError::PoolNotRegistered(_))
    ));
    assert!(matches!(registry.get::<Flaky>("sessions"), Err(PoolError::PoolTypeMismatch(_))));

    registry.shutdown_all().await;
    assert!(registry.is_empty());
}

#[cfg(feature = "metrics")]
#[tokio::test]
async fn prometheus_export_carries_pool_label() {
    let restores = Arc::new(AtomicUsize::new(0));
    let config = PoolConfiguration::new()
        .with_min_size(0)
        .with_max_size(2)
        .without_maintenance();
    let pool = session_pool(config, &restores);
    let session = pool.acquire().await.unwrap().unwrap();

    let output = pool.export_metrics_prometheus("sessions", None).unwrap();
    assert!(output.contains("respool_objects_in_use{pool=\"sessions\"} 1"));
    assert!(output.contains("respool_acquired_total{pool=\"sessions\"} 1"));

    pool.release(session).await.unwrap();
}
