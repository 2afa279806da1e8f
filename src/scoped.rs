//! Scoped reuse: one pooled object per call or per logical task
//!
//! [`ResourcePool::invoke`] lends an object to a single closure.
//! [`ResourcePool::with_scoped`] binds one object per pool to the current
//! logical task, which is delimited by [`task_scope`] (or
//! [`spawn_scoped`]). Every call site in that task gets the same object,
//! and it is released exactly once when the scope ends.
//!
//! ```
//! use respool::{task_scope, PoolConfiguration, PoolObject, ResourcePool};
//! use std::convert::Infallible;
//!
//! struct Session;
//! impl PoolObject for Session {}
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), respool::PoolError> {
//! let config = PoolConfiguration::new().with_min_size(0).with_max_size(4);
//! let pool = ResourcePool::new(|| async { Ok::<_, Infallible>(Session) }, config)?;
//!
//! task_scope(async {
//!     let first = pool.with_scoped(None).await?;
//!     let second = pool.with_scoped(None).await?;
//!     assert_eq!(first.identity(), second.identity());
//!     Ok::<_, respool::PoolError>(())
//! })
//! .await?;
//!
//! assert_eq!(pool.status().in_use, 0);
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::errors::{PoolError, PoolResult};
use crate::object::PoolObject;
use crate::pool::{Pooled, ResourcePool};

tokio::task_local! {
    static TASK_SCOPE: TaskScope;
}

/// Objects bound to one logical task, keyed by pool identity
#[derive(Clone, Default)]
struct TaskScope {
    bindings: Arc<Mutex<Vec<(u64, Arc<dyn ScopedBinding>)>>>,
}

impl TaskScope {
    fn current() -> PoolResult<Self> {
        TASK_SCOPE
            .try_with(TaskScope::clone)
            .map_err(|_| PoolError::NoTaskScope)
    }

    fn lookup<T: PoolObject>(&self, key: u64) -> Option<Scoped<T>> {
        find_binding(&self.bindings.lock(), key)
    }

    /// Bind `slot` unless another call site of this task won the race; the
    /// binding that ends up in the scope is returned.
    fn bind<T: PoolObject>(&self, key: u64, slot: Arc<ScopedSlot<T>>) -> Scoped<T> {
        let mut bindings = self.bindings.lock();
        if let Some(existing) = find_binding(&bindings, key) {
            return existing;
        }
        bindings.push((key, Arc::clone(&slot) as Arc<dyn ScopedBinding>));
        Scoped { slot }
    }

    async fn release_all(&self) {
        let bindings = std::mem::take(&mut *self.bindings.lock());
        for (_, binding) in bindings {
            binding.release().await;
        }
    }
}

fn find_binding<T: PoolObject>(bindings: &[(u64, Arc<dyn ScopedBinding>)], key: u64) -> Option<Scoped<T>> {
    let (_, binding) = bindings.iter().find(|(bound, _)| *bound == key)?;
    let slot = Arc::clone(binding).into_any().downcast::<ScopedSlot<T>>().ok()?;
    Some(Scoped { slot })
}

trait ScopedBinding: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn release(&self) -> BoxFuture<'_, ()>;
}

struct ScopedSlot<T: PoolObject> {
    pool: ResourcePool<T>,
    identity: u64,
    object: AsyncMutex<Option<Pooled<T>>>,
}

impl<T: PoolObject> ScopedBinding for ScopedSlot<T> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(object) = self.object.lock().await.take() else {
                return;
            };
            match self.pool.release(object).await {
                Ok(_) => trace!(pool = self.pool.id(), identity = self.identity, "scoped object released"),
                Err(err) => warn!(
                    pool = self.pool.id(),
                    identity = self.identity,
                    error = %err,
                    "failed to release scoped object"
                ),
            }
        })
    }
}

/// Handle to the object bound to the current task scope
///
/// Clones share the same object. Access it with [`lock`](Self::lock).
pub struct Scoped<T: PoolObject> {
    slot: Arc<ScopedSlot<T>>,
}

impl<T: PoolObject> Clone for Scoped<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: PoolObject> fmt::Debug for Scoped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped")
            .field("identity", &self.slot.identity)
            .field("pool", &self.slot.pool.id())
            .finish()
    }
}

impl<T: PoolObject> Scoped<T> {
    /// Pool identity of the bound object
    pub fn identity(&self) -> u64 {
        self.slot.identity
    }

    /// Whether both handles refer to the same binding
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Exclusive access to the object
    ///
    /// Fails with [`PoolError::ScopeEnded`] once the owning scope has
    /// released it.
    pub async fn lock(&self) -> PoolResult<ScopedGuard<'_, T>> {
        let guard = self.slot.object.lock().await;
        if guard.is_none() {
            return Err(PoolError::ScopeEnded);
        }
        Ok(ScopedGuard { guard })
    }
}

/// Exclusive borrow of a scoped object
pub struct ScopedGuard<'a, T: PoolObject> {
    guard: MutexGuard<'a, Option<Pooled<T>>>,
}

impl<T: PoolObject> Deref for ScopedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().expect("scoped object already released")
    }
}

impl<T: PoolObject> DerefMut for ScopedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().expect("scoped object already released")
    }
}

/// Run `fut` as one logical task
///
/// Objects bound with [`ResourcePool::with_scoped`] inside `fut` are
/// released when it completes. If the scope is dropped early the objects
/// go back through their guards instead.
pub async fn task_scope<F: Future>(fut: F) -> F::Output {
    let scope = TaskScope::default();
    let output = TASK_SCOPE.scope(scope.clone(), fut).await;
    scope.release_all().await;
    output
}

/// Spawn `fut` on the tokio runtime inside its own [`task_scope`]
pub fn spawn_scoped<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(task_scope(fut))
}

impl<T: PoolObject> ResourcePool<T> {
    /// Lend one object to `f` and release it on every exit path
    ///
    /// An exhausted pool is reported as [`PoolError::PoolEmpty`] through
    /// `E`. If `f` fails its error wins; otherwise a failing release hook
    /// is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use respool::{PoolConfiguration, PoolError, PoolObject, ResourcePool};
    /// use std::convert::Infallible;
    ///
    /// struct Counter(u32);
    /// impl PoolObject for Counter {}
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), PoolError> {
    /// let config = PoolConfiguration::new().with_min_size(0).with_max_size(1);
    /// let pool = ResourcePool::new(|| async { Ok::<_, Infallible>(Counter(0)) }, config)?;
    ///
    /// let seen = pool
    ///     .invoke(None, |counter| {
    ///         Box::pin(async move {
    ///             counter.0 += 1;
    ///             Ok::<_, PoolError>(counter.0)
    ///         })
    ///     })
    ///     .await?;
    /// assert_eq!(seen, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn invoke<R, E, F>(&self, timeout: Option<Duration>, f: F) -> Result<R, E>
    where
        F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<R, E>>,
        E: From<PoolError>,
    {
        let mut object = self
            .acquire_with(timeout, self.config().acquire_retries)
            .await?
            .ok_or(PoolError::PoolEmpty)?;

        let identity = object.identity();
        let outcome = f(&mut *object).await;
        let released = self.release(object).await;

        match (outcome, released) {
            (Ok(value), released) => {
                released?;
                Ok(value)
            }
            (Err(err), Err(release_err)) => {
                warn!(
                    pool = self.id(),
                    identity,
                    error = %release_err,
                    "failed to release object after invoke error"
                );
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
        }
    }

    /// Get the object bound to the current task scope, acquiring and
    /// binding one on first use
    ///
    /// Fails with [`PoolError::NoTaskScope`] outside [`task_scope`] and with
    /// [`PoolError::PoolEmpty`] if nothing could be acquired.
    pub async fn with_scoped(&self, timeout: Option<Duration>) -> PoolResult<Scoped<T>> {
        let scope = TaskScope::current()?;
        let key = self.id();
        if let Some(existing) = scope.lookup::<T>(key) {
            return Ok(existing);
        }

        let object = self
            .acquire_with(timeout, self.config().acquire_retries)
            .await?
            .ok_or(PoolError::PoolEmpty)?;
        let slot = Arc::new(ScopedSlot {
            pool: self.clone(),
            identity: object.identity(),
            object: AsyncMutex::new(Some(object)),
        });
        Ok(scope.bind(key, slot))
    }
}
