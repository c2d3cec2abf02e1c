use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{CacheStats, DataCache, ScopedDataFactory};
use crate::error::{ScopeError, ScopeResult};
use crate::maintenance::{Maintainable, MaintenanceReport};
use crate::processor::{DataProcessor, Processed};
use crate::scope::ScopeKey;
use crate::sync::lock;

/// Per-scope-set results, by identity.
///
/// Unmodified results are stored too, so a processor that legitimately
/// leaves a value alone is not asked again.
pub struct ResultMap<I, D> {
    results: Mutex<HashMap<I, Processed<D>>>,
}

impl<I: Eq + Hash, D: Clone> ResultMap<I, D> {
    fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &I) -> Option<Processed<D>> {
        lock(&self.results).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.results).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the first result stored for `id`; later ones are dropped.
    fn insert(&self, id: I, result: Processed<D>) -> Processed<D> {
        lock(&self.results).entry(id).or_insert(result).clone()
    }
}

struct ProcessorFactory<I, D, P> {
    processor: Arc<P>,
    _marker: PhantomData<fn(&I) -> D>,
}

impl<T, I, D, P> ScopedDataFactory<T> for ProcessorFactory<I, D, P>
where
    T: ?Sized + 'static,
    I: Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: DataProcessor<T, I, D> + 'static,
{
    type Data = ResultMap<I, D>;

    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()> {
        self.processor.register_scopes(target, key)
    }

    fn create_data(&self, _target: &T, _key: &ScopeKey) -> ResultMap<I, D> {
        ResultMap::new()
    }
}

/// Memoizes a [`DataProcessor`] per scope combination and identity.
pub struct ProcessorCache<T, I, D, P>
where
    T: ?Sized + 'static,
    I: Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: DataProcessor<T, I, D> + 'static,
{
    processor: Arc<P>,
    cache: DataCache<T, ProcessorFactory<I, D, P>>,
}

impl<T, I, D, P> ProcessorCache<T, I, D, P>
where
    T: ?Sized + 'static,
    I: Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: DataProcessor<T, I, D> + 'static,
{
    pub fn new(name: impl Into<String>, processor: Arc<P>) -> Self {
        let factory = ProcessorFactory {
            processor: Arc::clone(&processor),
            _marker: PhantomData,
        };
        Self {
            processor,
            cache: DataCache::new(name, factory),
        }
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    /// Number of scope combinations with stored results.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Process `data` for `(target, id)`, reusing a stored result when the
    /// target's current scope combination already has one for `id`.
    ///
    /// `data` is only consumed on a miss. Processor failures are returned
    /// as [`ScopeError::Processor`] and never stored.
    pub fn process(&self, target: &T, id: I, data: D) -> ScopeResult<Processed<D>> {
        let Some(entry) = self.cache.get_scoped_data(target)? else {
            CacheStats::bump(&self.stats().processor_invocations);
            return self
                .processor
                .process_data(target, None, &id, data)
                .map_err(ScopeError::processor);
        };

        if let Some(result) = entry.get(&id) {
            CacheStats::bump(&self.stats().result_hits);
            return Ok(result);
        }

        CacheStats::bump(&self.stats().processor_invocations);
        let result = self
            .processor
            .process_data(target, Some(entry.key()), &id, data)
            .map_err(ScopeError::processor)?;

        // A result computed under a key that went stale meanwhile is handed
        // back but not recorded.
        if !entry.key().is_valid() {
            debug!(
                cache = %self.cache.name(),
                key = entry.key().seq(),
                "Key invalidated while processing, result not stored"
            );
            return Ok(result);
        }
        Ok(entry.insert(id, result))
    }

    /// Drop every stored result.
    pub fn invalidate(&self) -> ScopeResult<usize> {
        self.cache.invalidate()
    }

    pub fn dispose(&self) {
        self.cache.dispose();
    }
}

impl<T, I, D, P> Maintainable for ProcessorCache<T, I, D, P>
where
    T: ?Sized + 'static,
    I: Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: DataProcessor<T, I, D> + 'static,
{
    fn maintain(&self) -> MaintenanceReport {
        self.cache.maintain()
    }
}

impl<T, I, D, P> fmt::Debug for ProcessorCache<T, I, D, P>
where
    T: ?Sized + 'static,
    I: Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: DataProcessor<T, I, D> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorCache")
            .field("cache", &self.cache)
            .finish()
    }
}
