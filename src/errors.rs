//! Error types for the resource pool

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by factories and lifecycle hooks
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared error source, kept behind an `Arc` so [`PoolError`] stays `Clone`
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Lifecycle hook that produced a [`PoolError::Hook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Run each time an object is handed out
    BeforeUse,

    /// Run each time an object is handed back
    ObjectRestore,

    /// Run when an object is permanently removed
    Destroy,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::BeforeUse => "before_use",
            Hook::ObjectRestore => "object_restore",
            Hook::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("invalid pool configuration: min_size ({min_size}) must be less than max_size ({max_size})")]
    InvalidConfiguration { min_size: usize, max_size: usize },

    #[error("Pool is empty - no objects available")]
    PoolEmpty,

    #[error("failed to create pool object: {0}")]
    Creation(#[source] SharedError),

    #[error("{hook} hook failed: {source}")]
    Hook {
        hook: Hook,
        #[source]
        source: SharedError,
    },

    #[error("no task scope is active on the current task")]
    NoTaskScope,

    #[error("task scope ended and its scoped object was released")]
    ScopeEnded,

    #[error("no pool registered under name `{0}`")]
    PoolNotRegistered(String),

    #[error("pool `{0}` does not manage the requested object type")]
    PoolTypeMismatch(String),

    #[error("failed to export metrics: {0}")]
    MetricsExport(String),
}

impl PoolError {
    pub(crate) fn creation(source: BoxError) -> Self {
        PoolError::Creation(Arc::from(source))
    }

    pub(crate) fn hook(hook: Hook, source: BoxError) -> Self {
        PoolError::Hook {
            hook,
            source: Arc::from(source),
        }
    }

    /// Whether retrying the operation later might succeed
    ///
    /// Configuration and misuse errors are permanent; creation and hook
    /// failures are usually transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolEmpty | PoolError::Creation(_) | PoolError::Hook { .. }
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_error_message() {
        let err = PoolError::hook(Hook::ObjectRestore, "socket closed".into());
        assert_eq!(err.to_string(), "object_restore hook failed: socket closed");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PoolError::PoolEmpty.is_retryable());
        assert!(PoolError::creation("refused".into()).is_retryable());
        assert!(!PoolError::NoTaskScope.is_retryable());
        assert!(
            !PoolError::InvalidConfiguration {
                min_size: 2,
                max_size: 2
            }
            .is_retryable()
        );
    }
}
