use std::sync::Arc;
use thiserror::Error;

/// Errors raised by scopes, scope keys and the caches built on them.
#[derive(Error, Debug, Clone)]
pub enum ScopeError {
    #[error("Scope '{0}' has been disposed")]
    ScopeDisposed(String),

    #[error("Scope key #{0} has been disposed")]
    KeyDisposed(u64),

    #[error("Scope key #{0} is not valid")]
    KeyInvalid(u64),

    #[error("Data cache '{0}' has been disposed")]
    CacheDisposed(String),

    #[error("Processor failed: {0:#}")]
    Processor(Arc<anyhow::Error>),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Shared computation ended without producing a result")]
    Aborted,
}

impl ScopeError {
    /// Wrap a consumer-supplied processor failure.
    pub fn processor(err: anyhow::Error) -> Self {
        ScopeError::Processor(Arc::new(err))
    }

    /// True for errors caused by touching a torn-down object.
    pub fn is_disposed(&self) -> bool {
        matches!(
            self,
            ScopeError::ScopeDisposed(_) | ScopeError::KeyDisposed(_) | ScopeError::CacheDisposed(_)
        )
    }
}

impl From<anyhow::Error> for ScopeError {
    fn from(err: anyhow::Error) -> Self {
        ScopeError::processor(err)
    }
}

pub type ScopeResult<T> = std::result::Result<T, ScopeError>;
