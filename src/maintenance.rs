//! Idle eviction, minimum-population keeping and the maintenance timer

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::errors::PoolResult;
use crate::object::PoolObject;
use crate::pool::{ResourcePool, Shared};

/// Outcome of one [`ResourcePool::maintain`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle objects discarded
    pub evicted: usize,

    /// Objects created to reach `min_size`
    pub created: usize,
}

impl<T: PoolObject> Shared<T> {
    /// Drain the queue, requeue entries idle for at most `max_idle` and
    /// discard the rest.
    pub(crate) async fn evict_idle(self: &Arc<Self>, max_idle: Duration) -> usize {
        let mut kept = Vec::new();
        let mut expired = Vec::new();

        while let Some(entry) = self.available.pop() {
            if entry.idle_since.elapsed() > max_idle {
                self.set_checked_out(entry.identity);
                // Guarded so a cancelled pass returns them instead of leaking.
                expired.push(self.guard(entry));
            } else {
                kept.push(entry);
            }
        }
        for entry in kept {
            self.requeue(entry);
        }
        // A shutdown that ran while the queue was empty missed the kept entries.
        if self.is_destroyed() {
            self.drain_available().await;
        }

        let mut evicted = 0;
        for pooled in expired {
            let identity = pooled.identity();
            match self.discard(pooled).await {
                Ok(removed) => evicted += usize::from(removed),
                Err(err) => {
                    evicted += 1;
                    warn!(pool = self.pool_id, identity, error = %err, "failed to destroy idle object");
                }
            }
        }

        if evicted > 0 {
            debug!(pool = self.pool_id, evicted, "evicted idle objects");
        }
        evicted
    }

    /// Create objects one at a time until `target` are tracked; returns how
    /// many were created. The first creation failure is returned unretried.
    pub(crate) async fn top_up(self: &Arc<Self>, target: usize) -> PoolResult<usize> {
        let target = target.min(self.config.max_size);
        let mut created = 0;
        while self.created() < target {
            if !self.create_object().await? {
                break;
            }
            created += 1;
        }
        Ok(created)
    }

    pub(crate) async fn maintain(self: &Arc<Self>) -> PoolResult<MaintenanceReport> {
        let evicted = self.evict_idle(self.config.max_idle_time).await;
        let created = match self.top_up(self.config.min_size).await {
            Ok(created) => created,
            Err(err) => {
                warn!(pool = self.pool_id, evicted, error = %err, "top-up failed after eviction");
                return Err(err);
            }
        };
        Ok(MaintenanceReport { evicted, created })
    }
}

/// Run [`Shared::maintain`] every `maintenance_interval` until the pool is
/// shut down or dropped.
pub(crate) fn spawn_timer<T: PoolObject>(shared: &Arc<Shared<T>>) {
    let interval = shared.config.maintenance_interval;
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(
            pool = shared.pool_id,
            "no tokio runtime at pool creation, automatic maintenance disabled"
        );
        return;
    };

    let weak = Arc::downgrade(shared);
    let task = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            if shared.is_destroyed() {
                break;
            }
            match shared.maintain().await {
                Ok(report) => debug!(
                    pool = shared.pool_id,
                    evicted = report.evicted,
                    created = report.created,
                    "maintenance pass finished"
                ),
                // Already logged with the eviction count.
                Err(err) => debug!(pool = shared.pool_id, error = %err, "maintenance pass failed"),
            }
        }
    });

    *shared.maintenance.lock() = Some(task);
}

impl<T: PoolObject> ResourcePool<T> {
    /// Discard queued objects idle for longer than `max_idle`
    ///
    /// Returns how many were removed. Checked-out objects are untouched.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        self.shared().evict_idle(max_idle).await
    }

    /// Create objects until at least `count` are tracked (capped at
    /// `max_size`)
    ///
    /// Returns the resulting created count. Stops at the first creation
    /// failure and returns it.
    pub async fn keep_min(&self, count: usize) -> PoolResult<usize> {
        let shared = self.shared();
        shared.top_up(count).await?;
        Ok(shared.created())
    }

    /// Warm the pool up before the first acquire; alias of
    /// [`keep_min`](Self::keep_min)
    pub async fn preload(&self, count: usize) -> PoolResult<usize> {
        self.keep_min(count).await
    }

    /// One maintenance pass: idle eviction with `max_idle_time`, then a
    /// top-up toward `min_size`
    ///
    /// This is what the background timer runs; it may also be called on
    /// demand.
    pub async fn maintain(&self) -> PoolResult<MaintenanceReport> {
        self.shared().maintain().await
    }
}
