//! # respool
//!
//! Generic, concurrency-safe async pool for expensive, reusable objects
//! such as connections and clients.
//!
//! ## Features
//!
//! - Bounded capacity with lazy creation by an async factory
//! - Automatic return of objects via RAII (Drop trait)
//! - Acquire timeout and a shared retry budget
//! - Lifecycle hooks: `before_use`, `object_restore`, `destroy`
//! - Idle eviction and minimum population kept by a background timer
//! - Per-call ([`ResourcePool::invoke`]) and per-task
//!   ([`ResourcePool::with_scoped`]) reuse
//! - Named pool registry
//! - Metrics snapshot and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use respool::{PoolConfiguration, PoolObject, ResourcePool};
//! use std::convert::Infallible;
//!
//! struct Connection {
//!     queries: u64,
//! }
//!
//! impl PoolObject for Connection {}
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), respool::PoolError> {
//! let pool = ResourcePool::new(
//!     || async { Ok::<_, Infallible>(Connection { queries: 0 }) },
//!     PoolConfiguration::default(),
//! )?;
//! {
//!     let mut conn = pool.acquire().await?.expect("pool exhausted");
//!     conn.queries += 1;
//!     // Object automatically returned when `conn` goes out of scope
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod errors;
mod maintenance;
mod metrics;
mod object;
mod pool;
mod registry;
mod scoped;

pub use config::{DEFAULT_ACQUIRE_RETRIES, PoolConfiguration};
pub use errors::{BoxError, Hook, PoolError, PoolResult, SharedError};
pub use maintenance::MaintenanceReport;
pub use metrics::{MetricsExporter, PoolMetrics};
pub use object::{ObjectFactory, PoolObject};
pub use pool::{PoolStatus, Pooled, ResourcePool};
pub use registry::PoolRegistry;
pub use scoped::{Scoped, ScopedGuard, spawn_scoped, task_scope};
