//! Data processors
//!
//! A data processor transforms a payload for a `(target, identity)` pair and
//! declares, through [`DataProcessor::register_scopes`], every scope its
//! output depends on.
//!
//! ## Purity
//!
//! For a fixed key and identity, `process_data` must always make the same
//! modification decision and produce the same output. Any input that can
//! change without one of the registered scopes being invalidated is a bug:
//! caches will keep serving the stale result. When called with `key = None`
//! the processor may depend on anything, and the caller must not cache the
//! result.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ScopeResult;
use crate::scope::ScopeKey;

mod async_composite;
mod composite;

pub use async_composite::CompositeAsyncDataProcessor;
pub use composite::{CompositeDataProcessor, ProcessorHandle};

/// Result of running a processor: the (possibly unchanged) payload and
/// whether the processor modified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed<D> {
    pub modified: bool,
    pub data: D,
}

impl<D> Processed<D> {
    pub fn modified(data: D) -> Self {
        Self {
            modified: true,
            data,
        }
    }

    pub fn unchanged(data: D) -> Self {
        Self {
            modified: false,
            data,
        }
    }

    pub fn into_inner(self) -> D {
        self.data
    }
}

/// A scope-pure transformation of `D` for a target `T` and identity `I`.
pub trait DataProcessor<T: ?Sized, I: ?Sized, D>: Send + Sync {
    /// Register every scope the processor's output for `target` depends on.
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()>;

    /// Transform `data`.
    fn process_data(
        &self,
        target: &T,
        key: Option<&ScopeKey>,
        id: &I,
        data: D,
    ) -> anyhow::Result<Processed<D>>;
}

impl<T: ?Sized, I: ?Sized, D, P: DataProcessor<T, I, D> + ?Sized> DataProcessor<T, I, D> for Arc<P> {
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()> {
        (**self).register_scopes(target, key)
    }

    fn process_data(
        &self,
        target: &T,
        key: Option<&ScopeKey>,
        id: &I,
        data: D,
    ) -> anyhow::Result<Processed<D>> {
        (**self).process_data(target, key, id, data)
    }
}

/// Asynchronous counterpart of [`DataProcessor`].
///
/// Implementations should check `cancel` at convenient points; a cancelled
/// call may return any error, it is never cached.
#[async_trait]
pub trait AsyncDataProcessor<T: ?Sized + Sync, I: ?Sized + Sync, D: Send>: Send + Sync {
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()>;

    async fn process_data(
        &self,
        target: &T,
        key: Option<&ScopeKey>,
        id: &I,
        data: D,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Processed<D>>;
}

#[async_trait]
impl<T, I, D, P> AsyncDataProcessor<T, I, D> for Arc<P>
where
    T: ?Sized + Sync + 'static,
    I: ?Sized + Sync + 'static,
    D: Send + 'static,
    P: AsyncDataProcessor<T, I, D> + ?Sized,
{
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()> {
        (**self).register_scopes(target, key)
    }

    async fn process_data(
        &self,
        target: &T,
        key: Option<&ScopeKey>,
        id: &I,
        data: D,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Processed<D>> {
        (**self).process_data(target, key, id, data, cancel).await
    }
}
