//! Core resource pool engine

use crate::config::PoolConfiguration;
use crate::errors::{Hook, PoolError, PoolResult};
use crate::maintenance;
#[cfg(feature = "metrics")]
use crate::metrics::MetricsExporter;
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::object::{ObjectFactory, PoolObject};

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Headroom above `max_size` in the available queue for racing releases
const QUEUE_SLACK: usize = 8;

/// Identities are process-wide so an object can never be mistaken for a
/// member of a pool it did not come from.
static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Queued object plus its pool bookkeeping
pub(crate) struct Entry<T> {
    pub identity: u64,
    pub idle_since: Instant,
    pub object: T,
}

impl<T> Entry<T> {
    fn new(identity: u64, object: T) -> Self {
        Self {
            identity,
            idle_since: Instant::now(),
            object,
        }
    }
}

/// Point-in-time population of a pool
///
/// Not transactionally consistent with concurrent acquire/release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolStatus {
    /// Objects tracked by the pool, queued or checked out
    pub created: usize,

    /// Objects currently checked out
    pub in_use: usize,

    /// Configured cap
    pub max: usize,

    /// Configured floor
    pub min: usize,
}

/// An object checked out of a [`ResourcePool`]
///
/// Dropping the guard hands the object back to its pool on a spawned task.
/// Use [`ResourcePool::release`] to hand it back inline and observe hook
/// errors.
pub struct Pooled<T: PoolObject> {
    object: Option<T>,
    identity: u64,
    pool: Arc<Shared<T>>,
}

impl<T: PoolObject> Pooled<T> {
    fn new(object: T, identity: u64, pool: Arc<Shared<T>>) -> Self {
        Self {
            object: Some(object),
            identity,
            pool,
        }
    }

    /// Pool-assigned identity of this object
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Take the object out of the pool for good
    ///
    /// Frees its slot without running the `destroy` hook.
    pub fn detach(self) -> T {
        let pool = Arc::clone(&self.pool);
        let (identity, object) = self.into_parts();
        pool.forget(identity);
        object
    }

    /// Split off the object; the emptied guard's drop is a no-op.
    pub(crate) fn into_parts(mut self) -> (u64, T) {
        let object = self.object.take().expect("pooled object already returned");
        (self.identity, object)
    }
}

impl<T: PoolObject> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("pooled object already returned")
    }
}

impl<T: PoolObject> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("pooled object already returned")
    }
}

impl<T: PoolObject> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let identity = self.identity;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = pool.check_in(identity, object).await {
                        warn!(pool = pool.pool_id, identity, error = %err, "failed to return dropped object");
                    }
                });
            }
            Err(_) => {
                warn!(
                    pool = pool.pool_id,
                    identity, "no tokio runtime while returning object, discarding it without hooks"
                );
                pool.forget(identity);
            }
        }
    }
}

impl<T: PoolObject> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("identity", &self.identity)
            .field("pool", &self.pool.pool_id)
            .finish()
    }
}

/// Decrements the created counter on drop unless disarmed
struct SlotRelease<'a> {
    created: &'a AtomicUsize,
    armed: bool,
}

impl<'a> SlotRelease<'a> {
    fn new(created: &'a AtomicUsize) -> Self {
        Self { created, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.created.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Forgets an identity on drop unless disarmed, so a cancelled check-in
/// never leaves a phantom member behind.
struct ForgetOnDrop<'a, T: PoolObject> {
    shared: &'a Shared<T>,
    identity: u64,
    armed: bool,
}

impl<T: PoolObject> ForgetOnDrop<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: PoolObject> Drop for ForgetOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget(self.identity);
        }
    }
}

/// State shared between a pool handle, its guards and its timer
pub(crate) struct Shared<T: PoolObject> {
    pub pool_id: u64,
    pub config: PoolConfiguration,
    factory: Box<dyn ObjectFactory<T>>,
    pub available: ArrayQueue<Entry<T>>,
    /// identity -> true while queued, false while checked out
    members: DashMap<u64, bool>,
    created: AtomicUsize,
    destroyed: AtomicBool,
    notify: Notify,
    pub metrics: MetricsTracker,
    pub maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<T: PoolObject> Shared<T> {
    fn new(factory: Box<dyn ObjectFactory<T>>, config: PoolConfiguration) -> Self {
        Self {
            pool_id: next_identity(),
            available: ArrayQueue::new(config.max_size + QUEUE_SLACK),
            config,
            factory,
            members: DashMap::new(),
            created: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            notify: Notify::new(),
            metrics: MetricsTracker::new(),
            maintenance: Mutex::new(None),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    fn is_member(&self, identity: u64) -> bool {
        self.members.contains_key(&identity)
    }

    fn is_available(&self, identity: u64) -> bool {
        self.members.get(&identity).map(|flag| *flag).unwrap_or(false)
    }

    pub(crate) fn set_checked_out(&self, identity: u64) {
        if let Some(mut flag) = self.members.get_mut(&identity) {
            *flag = false;
        }
    }

    /// Flip a checked-out member to available; false for foreign or
    /// already queued identities.
    fn claim_available(&self, identity: u64) -> bool {
        match self.members.get_mut(&identity) {
            Some(mut flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> PoolStatus {
        let created = self.created();
        PoolStatus {
            created,
            in_use: created.saturating_sub(self.available.len()),
            max: self.config.max_size,
            min: self.config.min_size,
        }
    }

    pub(crate) fn guard(self: &Arc<Self>, entry: Entry<T>) -> Pooled<T> {
        Pooled::new(entry.object, entry.identity, Arc::clone(self))
    }

    /// Build one object straight into the queue.
    ///
    /// `Ok(false)` when the pool is at capacity or shut down.
    pub(crate) async fn create_object(self: &Arc<Self>) -> PoolResult<bool> {
        if self.is_destroyed() {
            return Ok(false);
        }
        let max = self.config.max_size;
        let reserved = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok();
        if !reserved {
            return Ok(false);
        }

        let slot = SlotRelease::new(&self.created);
        let object = match self.factory.create().await {
            Ok(object) => object,
            Err(source) => {
                self.metrics.record_creation_failure();
                debug!(pool = self.pool_id, error = %source, "object creation failed");
                return Err(PoolError::creation(source));
            }
        };
        slot.disarm();

        let identity = next_identity();
        self.members.insert(identity, true);
        self.metrics.record_created();
        debug!(pool = self.pool_id, identity, "pool object created");

        self.enqueue(Entry::new(identity, object)).await;
        Ok(true)
    }

    /// Push an entry whose membership flag is already `true`.
    async fn enqueue(self: &Arc<Self>, entry: Entry<T>) {
        self.requeue(entry);
        // A shutdown that raced this push has already drained the queue.
        if self.is_destroyed() {
            self.drain_available().await;
        }
    }

    pub(crate) fn requeue(&self, entry: Entry<T>) {
        match self.available.push(entry) {
            Ok(()) => self.notify.notify_one(),
            Err(entry) => {
                warn!(
                    pool = self.pool_id,
                    identity = entry.identity,
                    "available queue saturated, dropping object"
                );
                self.forget(entry.identity);
            }
        }
    }

    async fn pop_available(&self, timeout: Duration) -> Option<Entry<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the checks so a `notify_waiters` from shutdown
            // cannot slip in between them and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.available.pop() {
                self.set_checked_out(entry.identity);
                return Some(entry);
            }
            if self.is_destroyed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let entry = self.available.pop()?;
                self.set_checked_out(entry.identity);
                return Some(entry);
            }
        }
    }

    /// Hand a checked-out object back to the queue.
    pub(crate) async fn check_in(self: &Arc<Self>, identity: u64, mut object: T) -> PoolResult<bool> {
        if self.is_destroyed() {
            return self.discard_parts(identity, object).await;
        }
        if !self.claim_available(identity) {
            return Ok(false);
        }

        let pending = ForgetOnDrop {
            shared: &**self,
            identity,
            armed: true,
        };
        let restored = object.object_restore().await;
        pending.disarm();

        if let Err(source) = restored {
            self.metrics.record_hook_failure();
            self.set_checked_out(identity);
            if let Err(err) = self.discard_parts(identity, object).await {
                debug!(pool = self.pool_id, identity, error = %err, "destroy after failed restore also failed");
            }
            return Err(PoolError::hook(Hook::ObjectRestore, source));
        }

        self.metrics.record_released();
        trace!(pool = self.pool_id, identity, "pool object released");
        self.enqueue(Entry::new(identity, object)).await;
        Ok(true)
    }

    /// Permanently remove a checked-out member.
    pub(crate) async fn discard_parts(&self, identity: u64, mut object: T) -> PoolResult<bool> {
        if self.members.remove_if(&identity, |_, available| !*available).is_none() {
            return Ok(false);
        }
        let _slot = SlotRelease::new(&self.created);
        self.metrics.record_destroyed();
        debug!(pool = self.pool_id, identity, "pool object discarded");

        object.destroy().await.map_err(|source| {
            self.metrics.record_hook_failure();
            PoolError::hook(Hook::Destroy, source)
        })?;
        Ok(true)
    }

    pub(crate) async fn discard(&self, pooled: Pooled<T>) -> PoolResult<bool> {
        let (identity, object) = pooled.into_parts();
        self.discard_parts(identity, object).await
    }

    /// Drop an identity from accounting without running hooks.
    fn forget(&self, identity: u64) {
        if self.members.remove(&identity).is_some() {
            self.created.fetch_sub(1, Ordering::AcqRel);
            self.metrics.record_destroyed();
        }
    }

    /// Discard everything currently queued; returns how many were removed.
    pub(crate) async fn drain_available(self: &Arc<Self>) -> usize {
        let mut drained = 0;
        while let Some(entry) = self.available.pop() {
            self.set_checked_out(entry.identity);
            let identity = entry.identity;
            match self.discard(self.guard(entry)).await {
                Ok(removed) => drained += usize::from(removed),
                Err(err) => {
                    drained += 1;
                    warn!(pool = self.pool_id, identity, error = %err, "failed to destroy drained object");
                }
            }
        }
        drained
    }
}

/// Bounded, concurrency-safe pool of reusable objects
///
/// Objects are built on demand by an [`ObjectFactory`] up to `max_size`,
/// handed out as [`Pooled`] guards, and kept between `min_size` and
/// `max_size` by periodic maintenance. Cloning the handle is cheap and
/// shares the same pool.
///
/// # Examples
///
/// ```
/// use respool::{PoolConfiguration, PoolObject, ResourcePool};
/// use std::convert::Infallible;
/// use std::time::Duration;
///
/// struct Client {
///     requests: u32,
/// }
///
/// impl PoolObject for Client {}
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), respool::PoolError> {
/// let config = PoolConfiguration::new()
///     .with_min_size(1)
///     .with_max_size(4)
///     .with_acquire_timeout(Duration::from_millis(100));
/// let pool = ResourcePool::new(|| async { Ok::<_, Infallible>(Client { requests: 0 }) }, config)?;
///
/// if let Some(mut client) = pool.acquire().await? {
///     client.requests += 1;
///     pool.release(client).await?;
/// }
///
/// assert_eq!(pool.status().in_use, 0);
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<T: PoolObject> {
    shared: Arc<Shared<T>>,
}

impl<T: PoolObject> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: PoolObject> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("id", &self.shared.pool_id)
            .field("status", &self.shared.status())
            .field("destroyed", &self.shared.is_destroyed())
            .finish()
    }
}

impl<T: PoolObject> ResourcePool<T> {
    /// Create a pool; fails if the configuration is invalid
    ///
    /// Starts the maintenance timer when `maintenance_interval` is non-zero
    /// and a tokio runtime is available.
    pub fn new<F>(factory: F, config: PoolConfiguration) -> PoolResult<Self>
    where
        F: ObjectFactory<T>,
    {
        config.validate()?;
        let shared = Arc::new(Shared::new(Box::new(factory), config));

        info!(
            pool = shared.pool_id,
            min = shared.config.min_size,
            max = shared.config.max_size,
            "resource pool created"
        );

        if shared.config.maintenance_enabled() {
            maintenance::spawn_timer(&shared);
        }

        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }

    /// Process-unique identity of this pool
    pub fn id(&self) -> u64 {
        self.shared.pool_id
    }

    /// Get an object with the configured timeout and retry budget
    ///
    /// `Ok(None)` means the pool is exhausted or shut down.
    pub async fn acquire(&self) -> PoolResult<Option<Pooled<T>>> {
        self.acquire_with(None, self.shared.config.acquire_retries).await
    }

    /// Get an object, waiting at most `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> PoolResult<Option<Pooled<T>>> {
        self.acquire_with(Some(timeout), self.shared.config.acquire_retries).await
    }

    /// Get an object with an explicit timeout and retry budget
    ///
    /// Creation failures and `before_use` rejections each consume one retry
    /// and restart the whole acquire. Once the budget is spent the last
    /// creation or hook error is returned, or `Ok(None)` if the hook merely
    /// returned `false`. `timeout` bounds each wait on the queue.
    pub async fn acquire_with(
        &self,
        timeout: Option<Duration>,
        retries: usize,
    ) -> PoolResult<Option<Pooled<T>>> {
        let shared = &self.shared;
        let timeout = timeout.unwrap_or(shared.config.acquire_timeout);
        let mut retries_left = retries;

        loop {
            if shared.is_destroyed() {
                shared.metrics.record_empty();
                return Ok(None);
            }

            if shared.available.is_empty()
                && let Err(err) = shared.create_object().await
            {
                if retries_left == 0 {
                    return Err(err);
                }
                retries_left -= 1;
                debug!(pool = shared.pool_id, retries_left, error = %err, "retrying acquire after creation failure");
                continue;
            }

            let Some(entry) = shared.pop_available(timeout).await else {
                shared.metrics.record_empty();
                trace!(pool = shared.pool_id, ?timeout, "acquire found pool exhausted");
                return Ok(None);
            };

            let mut pooled = shared.guard(entry);
            let rejection = match pooled.before_use().await {
                Ok(true) => {
                    shared.metrics.record_acquired();
                    trace!(pool = shared.pool_id, identity = pooled.identity, "pool object acquired");
                    return Ok(Some(pooled));
                }
                Ok(false) => None,
                Err(source) => Some(PoolError::hook(Hook::BeforeUse, source)),
            };

            shared.metrics.record_hook_failure();
            let identity = pooled.identity;
            if let Err(err) = shared.discard(pooled).await {
                debug!(pool = shared.pool_id, identity, error = %err, "destroy of rejected object failed");
            }

            if retries_left == 0 {
                return match rejection {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }
            retries_left -= 1;
        }
    }

    /// Hand an object back
    ///
    /// Returns `false` if the object does not belong to this pool or is
    /// already queued. On a shut down pool the object is discarded. A
    /// failing `object_restore` hook discards the object and returns the
    /// hook error.
    pub async fn release(&self, object: Pooled<T>) -> PoolResult<bool> {
        if !Arc::ptr_eq(&object.pool, &self.shared) {
            return Ok(false);
        }
        let (identity, object) = object.into_parts();
        self.shared.check_in(identity, object).await
    }

    /// Permanently remove a checked-out object
    ///
    /// The slot is freed even if the `destroy` hook fails; the hook error
    /// is still returned.
    pub async fn discard(&self, object: Pooled<T>) -> PoolResult<bool> {
        if !Arc::ptr_eq(&object.pool, &self.shared) {
            return Ok(false);
        }
        self.shared.discard(object).await
    }

    /// Whether `object` was produced by this pool and is still tracked
    pub fn owns(&self, object: &Pooled<T>) -> bool {
        Arc::ptr_eq(&object.pool, &self.shared) && self.shared.is_member(object.identity)
    }

    /// Whether `identity` is a member of this pool
    pub fn is_member(&self, identity: u64) -> bool {
        self.shared.is_member(identity)
    }

    /// Whether `identity` is a member currently sitting in the queue
    pub fn is_available(&self, identity: u64) -> bool {
        self.shared.is_available(identity)
    }

    /// Get the current population
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics.snapshot(&self.shared.status())
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "metrics")]
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> PoolResult<String> {
        MetricsExporter::export_prometheus(&self.metrics(), pool_name, tags)
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfiguration {
        &self.shared.config
    }

    /// Get available count
    pub fn available_count(&self) -> usize {
        self.shared.available.len()
    }

    /// Get checked-out count
    pub fn in_use_count(&self) -> usize {
        self.shared.status().in_use
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Stop the pool
    ///
    /// Cancels the maintenance timer, wakes waiters and discards every
    /// queued object. Objects still checked out are discarded when they
    /// come back. Calling it again only re-drains the queue.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let first = !shared.destroyed.swap(true, Ordering::AcqRel);

        if let Some(timer) = shared.maintenance.lock().take() {
            timer.abort();
        }
        shared.notify.notify_waiters();
        let drained = shared.drain_available().await;

        if first {
            info!(pool = shared.pool_id, drained, "resource pool shut down");
        }
    }
}
