use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CacheStats, DataCache, ScopedDataFactory};
use crate::error::{ScopeError, ScopeResult};
use crate::maintenance::{Maintainable, MaintenanceReport};
use crate::processor::{AsyncDataProcessor, Processed};
use crate::scope::ScopeKey;
use crate::sync::lock;

/// Published once by the computing task.
type Outcome<D> = Option<ScopeResult<Processed<D>>>;

struct InFlight<D> {
    rx: watch::Receiver<Outcome<D>>,
    /// Cancels the shared computation; only fired when the last observer
    /// leaves.
    token: CancellationToken,
}

impl<D> InFlight<D> {
    /// The computing task is gone without having published a result.
    fn is_orphaned(&self) -> bool {
        self.rx.has_changed().is_err() || self.token.is_cancelled()
    }
}

enum Slot<D> {
    Ready(Processed<D>),
    Pending {
        flight: Arc<InFlight<D>>,
        observers: usize,
    },
}

/// Per-scope-set results and in-flight computations, by identity.
pub struct AsyncResultMap<I, D> {
    slots: Mutex<HashMap<I, Slot<D>>>,
}

impl<I, D> AsyncResultMap<I, D> {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

/// Leaves the observer set of an in-flight computation when dropped,
/// cancelling it if nobody else is waiting.
struct ObserverGuard<I: Eq + Hash, D> {
    results: Arc<AsyncResultMap<I, D>>,
    id: I,
    flight: Arc<InFlight<D>>,
}

impl<I: Eq + Hash, D> Drop for ObserverGuard<I, D> {
    fn drop(&mut self) {
        let mut slots = lock(&self.results.slots);
        let last = match slots.get_mut(&self.id) {
            Some(Slot::Pending { flight, observers }) if Arc::ptr_eq(flight, &self.flight) => {
                *observers -= 1;
                *observers == 0
            }
            _ => false,
        };
        if last {
            slots.remove(&self.id);
            self.flight.token.cancel();
        }
    }
}

struct AsyncProcessorFactory<I, D, P> {
    processor: Arc<P>,
    _marker: PhantomData<fn(&I) -> D>,
}

impl<T, I, D, P> ScopedDataFactory<T> for AsyncProcessorFactory<I, D, P>
where
    T: ?Sized + Sync + 'static,
    I: Eq + Hash + Sync + Send + 'static,
    D: Clone + Send + Sync + 'static,
    P: AsyncDataProcessor<T, I, D> + 'static,
{
    type Data = AsyncResultMap<I, D>;

    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()> {
        self.processor.register_scopes(target, key)
    }

    fn create_data(&self, _target: &T, _key: &ScopeKey) -> AsyncResultMap<I, D> {
        AsyncResultMap::new()
    }
}

/// Memoizes an [`AsyncDataProcessor`] per scope combination and identity,
/// coalescing concurrent requests for the same identity into one
/// computation.
///
/// Computations run on spawned tokio tasks; every caller waits with its own
/// [`CancellationToken`]. A cancelled caller stops waiting with
/// [`ScopeError::Cancelled`]. The shared computation is cancelled only once
/// no caller is waiting for it any more.
pub struct AsyncProcessorCache<T, I, D, P>
where
    T: ?Sized + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: AsyncDataProcessor<T, I, D> + 'static,
{
    processor: Arc<P>,
    cache: DataCache<T, AsyncProcessorFactory<I, D, P>>,
}

impl<T, I, D, P> AsyncProcessorCache<T, I, D, P>
where
    T: ?Sized + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: AsyncDataProcessor<T, I, D> + 'static,
{
    pub fn new(name: impl Into<String>, processor: Arc<P>) -> Self {
        let factory = AsyncProcessorFactory {
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

    pub fn stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.cache
            .entries()
            .iter()
            .map(|entry| {
                lock(&entry.slots)
                    .values()
                    .filter(|slot| matches!(slot, Slot::Pending { .. }))
                    .count()
            })
            .sum()
    }

    /// Process `data` for `(target, id)`.
    ///
    /// Must be called from within a tokio runtime. `data` is only consumed
    /// if this call starts a new computation.
    pub async fn process(
        &self,
        target: Arc<T>,
        id: I,
        data: D,
        cancel: &CancellationToken,
    ) -> ScopeResult<Processed<D>> {
        if cancel.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }

        let Some(entry) = self.cache.get_scoped_data(&target)? else {
            CacheStats::bump(&self.stats().processor_invocations);
            return tokio::select! {
                _ = cancel.cancelled() => Err(ScopeError::Cancelled),
                result = self.processor.process_data(&target, None, &id, data, cancel) => {
                    result.map_err(ScopeError::processor)
                }
            };
        };

        let results = Arc::clone(entry.data());
        let (flight, sender) = {
            let mut slots = lock(&results.slots);
            match slots.get_mut(&id) {
                Some(Slot::Ready(result)) => {
                    CacheStats::bump(&self.stats().result_hits);
                    return Ok(result.clone());
                }
                Some(Slot::Pending { flight, observers }) => {
                    *observers += 1;
                    CacheStats::bump(&self.stats().coalesced);
                    (Arc::clone(flight), None)
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    let flight = Arc::new(InFlight {
                        rx,
                        token: CancellationToken::new(),
                    });
                    slots.insert(
                        id.clone(),
                        Slot::Pending {
                            flight: Arc::clone(&flight),
                            observers: 1,
                        },
                    );
                    (flight, Some(tx))
                }
            }
        };

        let _guard = ObserverGuard {
            results: Arc::clone(&results),
            id: id.clone(),
            flight: Arc::clone(&flight),
        };

        if let Some(tx) = sender {
            CacheStats::bump(&self.stats().processor_invocations);
            self.spawn_computation(
                target,
                entry.key().clone(),
                id,
                data,
                results,
                Arc::clone(&flight),
                tx,
            );
        }

        wait_for_outcome(&flight, cancel).await
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_computation(
        &self,
        target: Arc<T>,
        key: ScopeKey,
        id: I,
        data: D,
        results: Arc<AsyncResultMap<I, D>>,
        flight: Arc<InFlight<D>>,
        tx: watch::Sender<Outcome<D>>,
    ) {
        let processor = Arc::clone(&self.processor);
        let name = self.cache.name().to_string();

        tokio::spawn(async move {
            let token = flight.token.clone();
            let result = tokio::select! {
                _ = token.cancelled() => Err(ScopeError::Cancelled),
                result = processor.process_data(&target, Some(&key), &id, data, &token) => {
                    result.map_err(ScopeError::processor)
                }
            };

            // Settle the slot before publishing so a caller woken by the
            // result never finds it still pending.
            {
                let mut slots = lock(&results.slots);
                let current = matches!(
                    slots.get(&id),
                    Some(Slot::Pending { flight: f, .. }) if Arc::ptr_eq(f, &flight)
                );
                if current {
                    match &result {
                        Ok(processed) if key.is_valid() => {
                            slots.insert(id, Slot::Ready(processed.clone()));
                        }
                        _ => {
                            slots.remove(&id);
                        }
                    }
                }
            }

            if let Err(e) = &result {
                debug!(cache = %name, key = key.seq(), error = %e, "Async computation failed");
            }
            let _ = tx.send(Some(result));
        });
    }

    /// Drop pending slots whose computation vanished without publishing.
    fn prune_orphans(&self) -> usize {
        self.cache
            .entries()
            .iter()
            .map(|entry| {
                let mut slots = lock(&entry.slots);
                let before = slots.len();
                slots.retain(|_, slot| match slot {
                    Slot::Ready(_) => true,
                    Slot::Pending { flight, .. } => !flight.is_orphaned(),
                });
                before - slots.len()
            })
            .sum()
    }

    pub fn invalidate(&self) -> ScopeResult<usize> {
        self.cache.invalidate()
    }

    pub fn dispose(&self) {
        self.cache.dispose();
    }
}

async fn wait_for_outcome<D: Clone>(
    flight: &InFlight<D>,
    cancel: &CancellationToken,
) -> ScopeResult<Processed<D>> {
    let mut rx = flight.rx.clone();
    loop {
        let published = rx.borrow_and_update().clone();
        if let Some(outcome) = published {
            return outcome;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ScopeError::Cancelled),
            changed = rx.changed() => {
                if changed.is_err() {
                    let last = rx.borrow().clone();
                    return last.unwrap_or(Err(ScopeError::Aborted));
                }
            }
        }
    }
}

impl<T, I, D, P> Maintainable for AsyncProcessorCache<T, I, D, P>
where
    T: ?Sized + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: AsyncDataProcessor<T, I, D> + 'static,
{
    fn maintain(&self) -> MaintenanceReport {
        let mut report = self.cache.maintain();
        report.reclaimed += self.prune_orphans();
        report
    }
}

impl<T, I, D, P> fmt::Debug for AsyncProcessorCache<T, I, D, P>
where
    T: ?Sized + Send + Sync + 'static,
    I: Eq + Hash + Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    P: AsyncDataProcessor<T, I, D> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncProcessorCache")
            .field("cache", &self.cache)
            .finish()
    }
}
