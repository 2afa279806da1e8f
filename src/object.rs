//! Factory and lifecycle hook traits implemented by pooled types

use std::future::Future;

use async_trait::async_trait;

use crate::errors::BoxError;

/// Lifecycle hooks an object may opt into
///
/// Every method has a no-op default, so a type with no special lifecycle
/// only needs an empty `impl`.
///
/// # Examples
///
/// ```
/// use respool::{BoxError, PoolObject};
///
/// struct Session {
///     open: bool,
/// }
///
/// #[async_trait::async_trait]
/// impl PoolObject for Session {
///     async fn before_use(&mut self) -> Result<bool, BoxError> {
///         Ok(self.open)
///     }
/// }
/// ```
#[async_trait]
pub trait PoolObject: Send + 'static {
    /// Called each time the object is handed out.
    ///
    /// Returning `false` or an error discards the object and restarts the
    /// acquire.
    async fn before_use(&mut self) -> Result<bool, BoxError> {
        Ok(true)
    }

    /// Called each time the object is handed back; an error discards it.
    async fn object_restore(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once when the object is permanently removed from the pool.
    async fn destroy(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Builds new objects for a pool
///
/// Called concurrently and repeatedly; the pool never serializes calls.
/// Any `Fn() -> impl Future<Output = Result<T, E>>` is a factory.
#[async_trait]
pub trait ObjectFactory<T>: Send + Sync + 'static {
    async fn create(&self) -> Result<T, BoxError>;
}

#[async_trait]
impl<T, F, Fut, E> ObjectFactory<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn create(&self) -> Result<T, BoxError> {
        (self)().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    struct Plain;

    impl PoolObject for Plain {}

    #[tokio::test]
    async fn test_default_hooks_accept() {
        let mut obj = Plain;
        assert!(obj.before_use().await.unwrap());
        assert!(obj.object_restore().await.is_ok());
        assert!(obj.destroy().await.is_ok());
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = || async { Ok::<_, Infallible>(7_u32) };
        assert_eq!(factory.create().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_closure_factory_error_is_boxed() {
        let factory = || async {
            Err::<u32, _>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        };
        let err = factory.create().await.unwrap_err();
        assert_eq!(err.to_string(), "refused");
    }
}
