//! Name-keyed registry of pools of different object types

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::errors::{PoolError, PoolResult};
use crate::object::PoolObject;
use crate::pool::{PoolStatus, ResourcePool};
use crate::scoped::Scoped;

/// Type-erased view of a [`ResourcePool`]
trait ManagedPool: Send + Sync {
    fn status(&self) -> PoolStatus;

    fn shutdown(&self) -> BoxFuture<'_, ()>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: PoolObject> ManagedPool for ResourcePool<T> {
    fn status(&self) -> PoolStatus {
        ResourcePool::status(self)
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(ResourcePool::shutdown(self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Pools registered under caller-chosen names
///
/// # Examples
///
/// ```
/// use respool::{PoolConfiguration, PoolObject, PoolRegistry, ResourcePool};
/// use std::convert::Infallible;
///
/// struct Mailer;
/// impl PoolObject for Mailer {}
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), respool::PoolError> {
/// let registry = PoolRegistry::new();
/// let config = PoolConfiguration::new().with_min_size(0).with_max_size(2);
/// registry.register("mail", ResourcePool::new(|| async { Ok::<_, Infallible>(Mailer) }, config)?);
///
/// let pool = registry.get::<Mailer>("mail")?;
/// assert!(pool.acquire().await?.is_some());
/// registry.shutdown_all().await;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<dyn ManagedPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pool` under `name`
    ///
    /// Returns `true` if an earlier pool was replaced. The replaced pool is
    /// not shut down.
    pub fn register<T: PoolObject>(&self, name: impl Into<String>, pool: ResourcePool<T>) -> bool {
        let name = name.into();
        let pool_id = pool.id();
        let replaced = self.pools.insert(name.clone(), Arc::new(pool)).is_some();
        debug!(name = %name, pool = pool_id, replaced, "pool registered");
        replaced
    }

    /// Handle to the pool registered under `name`
    pub fn get<T: PoolObject>(&self, name: &str) -> PoolResult<ResourcePool<T>> {
        let entry = self
            .pools
            .get(name)
            .ok_or_else(|| PoolError::PoolNotRegistered(name.to_string()))?;
        entry
            .as_any()
            .downcast_ref::<ResourcePool<T>>()
            .cloned()
            .ok_or_else(|| PoolError::PoolTypeMismatch(name.to_string()))
    }

    /// Unregister `name` without shutting its pool down
    pub fn remove(&self, name: &str) -> bool {
        self.pools.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Status of every registered pool, by name
    pub fn statuses(&self) -> HashMap<String, PoolStatus> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    /// [`ResourcePool::invoke`] on the pool registered under `name`
    pub async fn invoke<T, R, E, F>(&self, name: &str, timeout: Option<Duration>, f: F) -> Result<R, E>
    where
        T: PoolObject,
        F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<R, E>>,
        E: From<PoolError>,
    {
        let pool = self.get::<T>(name)?;
        pool.invoke(timeout, f).await
    }

    /// [`ResourcePool::with_scoped`] on the pool registered under `name`
    pub async fn with_scoped<T: PoolObject>(&self, name: &str, timeout: Option<Duration>) -> PoolResult<Scoped<T>> {
        let pool = self.get::<T>(name)?;
        pool.with_scoped(timeout).await
    }

    /// Shut down and unregister every pool
    pub async fn shutdown_all(&self) {
        // Clone the handles out so no shard lock is held across an await.
        let pools: Vec<(String, Arc<dyn ManagedPool>)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (name, pool) in &pools {
            pool.shutdown().await;
            self.pools.remove(name);
        }
        info!(pools = pools.len(), "registry shut down");
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pool_count", &self.pools.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{Conn, Probe, conn_pool, small_config};
    use crate::scoped::task_scope;
    use std::convert::Infallible;

    struct Blob;

    impl PoolObject for Blob {}

    fn registry_with_conn(probe: &Arc<Probe>) -> PoolRegistry {
        let registry = PoolRegistry::new();
        assert!(!registry.register("db", conn_pool(probe, small_config())));
        registry
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let probe = Arc::new(Probe::default());
        let registry = registry_with_conn(&probe);

        let first = registry.get::<Conn>("db").unwrap();
        let second = registry.get::<Conn>("db").unwrap();
        assert_eq!(first.id(), second.id());
        assert!(registry.contains("db"));
        assert_eq!(registry.names(), vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let probe = Arc::new(Probe::default());
        let registry = registry_with_conn(&probe);

        assert!(matches!(
            registry.get::<Conn>("cache"),
            Err(PoolError::PoolNotRegistered(name)) if name == "cache"
        ));
        assert!(matches!(
            registry.get::<Blob>("db"),
            Err(PoolError::PoolTypeMismatch(name)) if name == "db"
        ));
    }

    #[tokio::test]
    async fn test_register_replaces_previous() {
        let probe = Arc::new(Probe::default());
        let registry = registry_with_conn(&probe);
        let old = registry.get::<Conn>("db").unwrap();

        let blobs = ResourcePool::new(|| async { Ok::<_, Infallible>(Blob) }, small_config()).unwrap();
        assert!(registry.register("db", blobs));
        assert!(registry.get::<Blob>("db").is_ok());
        assert!(!old.is_destroyed());

        assert!(registry.remove("db"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_and_scoped_by_name() {
        let probe = Arc::new(Probe::default());
        let registry = registry_with_conn(&probe);

        let serial = registry
            .invoke::<Conn, _, PoolError, _>("db", None, |conn| Box::pin(async move { Ok(conn.serial) }))
            .await
            .unwrap();
        assert_eq!(serial, 0);

        let identity = task_scope(async {
            let scoped = registry.with_scoped::<Conn>("db", None).await.unwrap();
            let again = registry.with_scoped::<Conn>("db", None).await.unwrap();
            assert!(scoped.ptr_eq(&again));
            scoped.identity()
        })
        .await;

        let pool = registry.get::<Conn>("db").unwrap();
        assert!(pool.is_available(identity));
        assert_eq!(registry.statuses()["db"].in_use, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let probe = Arc::new(Probe::default());
        let registry = registry_with_conn(&probe);
        let blobs = ResourcePool::new(|| async { Ok::<_, Infallible>(Blob) }, small_config()).unwrap();
        registry.register("blobs", blobs.clone());

        let db = registry.get::<Conn>("db").unwrap();
        let conn = db.acquire().await.unwrap().unwrap();
        db.release(conn).await.unwrap();

        registry.shutdown_all().await;
        assert!(registry.is_empty());
        assert!(db.is_destroyed());
        assert!(blobs.is_destroyed());
        assert_eq!(db.status().created, 0);
        assert_eq!(probe.destroyed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
