//! Basic usage of ResourcePool

use async_trait::async_trait;
use respool::{BoxError, PoolConfiguration, PoolError, PoolObject, PoolRegistry, ResourcePool, task_scope};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Connection {
    id: u32,
    queries: u32,
}

#[async_trait]
impl PoolObject for Connection {
    async fn before_use(&mut self) -> Result<bool, BoxError> {
        // Pretend the server closes connections after a few queries.
        Ok(self.queries < 5)
    }

    async fn object_restore(&mut self) -> Result<(), BoxError> {
        println!("   restoring connection {}", self.id);
        Ok(())
    }

    async fn destroy(&mut self) -> Result<(), BoxError> {
        println!("   closing connection {}", self.id);
        Ok(())
    }
}

fn connection_pool(min: usize, max: usize) -> Result<ResourcePool<Connection>, PoolError> {
    let next_id = Arc::new(AtomicU32::new(1));
    let config = PoolConfiguration::new()
        .with_min_size(min)
        .with_max_size(max)
        .with_acquire_timeout(Duration::from_millis(100))
        .with_max_idle_time(Duration::from_secs(5));

    ResourcePool::new(
        move || {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(Connection { id, queries: 0 }) }
        },
        config,
    )
}

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    println!("=== respool - Basic Examples ===\n");

    // Example 1: Acquire and release
    acquire_release().await?;

    // Example 2: Exhaustion and timeout
    exhaustion().await?;

    // Example 3: Scoped reuse
    scoped_reuse().await?;

    // Example 4: Registry and metrics
    registry_and_metrics().await?;

    Ok(())
}

async fn acquire_release() -> Result<(), PoolError> {
    println!("1. Acquire and release:");
    let pool = connection_pool(1, 4)?;

    let Some(mut conn) = pool.acquire().await? else {
        println!("   pool exhausted");
        return Ok(());
    };
    conn.queries += 1;
    println!("   using connection {}", conn.id);
    pool.release(conn).await?;

    println!("   status after release: {:?}\n", pool.status());
    pool.shutdown().await;
    Ok(())
}

async fn exhaustion() -> Result<(), PoolError> {
    println!("2. Exhaustion and timeout:");
    let pool = connection_pool(1, 2)?;

    let _first = pool.acquire().await?;
    let _second = pool.acquire().await?;
    match pool.acquire().await? {
        Some(conn) => println!("   unexpectedly got connection {}", conn.id),
        None => println!("   third acquire timed out, pool is full"),
    }

    println!("   in use: {}\n", pool.in_use_count());
    Ok(())
}

async fn scoped_reuse() -> Result<(), PoolError> {
    println!("3. Scoped reuse:");
    let pool = connection_pool(0, 4)?;

    task_scope(async {
        for step in 0..3 {
            let scoped = pool.with_scoped(None).await?;
            let mut conn = scoped.lock().await?;
            conn.queries += 1;
            println!("   step {step} runs on connection {}", conn.id);
        }
        Ok::<_, PoolError>(())
    })
    .await?;

    let total = pool
        .invoke(None, |conn| Box::pin(async move { Ok::<_, PoolError>(conn.queries) }))
        .await?;
    println!("   connection ran {total} queries\n");
    Ok(())
}

async fn registry_and_metrics() -> Result<(), PoolError> {
    println!("4. Registry and metrics:");
    let registry = PoolRegistry::new();
    registry.register("primary", connection_pool(1, 4)?);

    let pool = registry.get::<Connection>("primary")?;
    for _ in 0..3 {
        if let Some(conn) = pool.acquire().await? {
            pool.release(conn).await?;
        }
    }

    let metrics = pool.metrics();
    println!("   acquired: {}", metrics.total_acquired);
    println!("   released: {}", metrics.total_released);
    println!("   utilization: {:.2}", metrics.utilization);

    #[cfg(feature = "metrics")]
    println!("\n{}", pool.export_metrics_prometheus("primary", None)?);

    registry.shutdown_all().await;
    Ok(())
}
