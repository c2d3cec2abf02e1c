//! Scope-aware memoizing caches
//!
//! A [`DataCache`] maps a target to a payload, keyed by the set of scopes the
//! payload was derived from. Looking a target up derives a fresh
//! [`ScopeKey`], lets the factory register the scopes the target depends on,
//! and finds the stored entry whose key holds exactly the same scopes. When
//! any of those scopes is invalidated the stored key goes invalid and the
//! entry is evicted: the key is disposed, then the payload.
//!
//! # Locking
//!
//! One mutex guards the entry map. It is never held while calling into the
//! factory or while taking a key's main lock; only the narrow key validity
//! check happens under it.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

use crate::error::{ScopeError, ScopeResult};
use crate::logging::status;
use crate::maintenance::{Maintainable, MaintenanceReport};
use crate::scope::{KeyIdentity, ScopeKey};
use crate::sync::lock;

mod async_processor;
mod processor;
mod stats;

pub use async_processor::AsyncProcessorCache;
pub use processor::{ProcessorCache, ResultMap};
pub use stats::{CacheStats, CacheStatsSnapshot};

/// The overridable behavior of a [`DataCache`].
pub trait ScopedDataFactory<T: ?Sized>: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    /// Derive a fresh key for `target`. `None` marks the target uncacheable.
    fn create_key(&self, _target: &T) -> Option<ScopeKey> {
        Some(ScopeKey::new())
    }

    /// Register every scope the payload for `target` depends on.
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()>;

    fn create_data(&self, target: &T, key: &ScopeKey) -> Self::Data;

    /// Called exactly once for every created payload, after its entry has
    /// been removed.
    fn dispose_data(&self, _data: &Self::Data) {}
}

/// A payload together with the cache-owned key it is stored under.
pub struct ScopedEntry<D> {
    key: ScopeKey,
    data: Arc<D>,
}

impl<D> ScopedEntry<D> {
    /// The stored key. It goes invalid as soon as the entry is evicted.
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn data(&self) -> &Arc<D> {
        &self.data
    }

    pub fn into_data(self) -> Arc<D> {
        self.data
    }
}

impl<D> Clone for ScopedEntry<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: Arc::clone(&self.data),
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for ScopedEntry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedEntry")
            .field("key", &self.key)
            .field("data", &self.data)
            .finish()
    }
}

impl<D> Deref for ScopedEntry<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.data
    }
}

/// Single-flight payload cell.
struct Payload<D> {
    cell: OnceLock<Arc<D>>,
    released: AtomicBool,
}

impl<D> Payload<D> {
    fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Run `dispose` on the payload if it was created and not yet released.
    fn release(&self, dispose: impl FnOnce(&D)) {
        if let Some(data) = self.cell.get() {
            if !self.released.swap(true, Ordering::SeqCst) {
                dispose(data);
            }
        }
    }
}

struct Slot<D> {
    key: ScopeKey,
    payload: Arc<Payload<D>>,
}

struct CacheState<D> {
    entries: HashMap<KeyIdentity, Slot<D>>,
    disposed: bool,
}

struct Shared<T: ?Sized, F: ScopedDataFactory<T>> {
    name: String,
    factory: F,
    state: Mutex<CacheState<F::Data>>,
    stats: CacheStats,
    _target: PhantomData<fn(&T)>,
}

impl<T: ?Sized + 'static, F: ScopedDataFactory<T>> Shared<T, F> {
    /// Tear down a slot that is no longer in the map: key first, payload
    /// second.
    fn evict(&self, slot: Slot<F::Data>) {
        slot.key.dispose();
        slot.payload.release(|data| self.factory.dispose_data(data));
        CacheStats::bump(&self.stats.evictions);
    }

    /// Remove the entry for `identity` if it is still the one stored under
    /// key `seq`.
    fn remove_if_current(&self, identity: &KeyIdentity, seq: u64) {
        let removed = {
            let mut state = lock(&self.state);
            let current = state
                .entries
                .get(identity)
                .is_some_and(|slot| slot.key.seq() == seq);
            if current {
                state.entries.remove(identity)
            } else {
                None
            }
        };
        if let Some(slot) = removed {
            debug!(cache = %self.name, key = seq, "Entry invalidated");
            self.evict(slot);
        }
    }

    fn disposed_error(&self) -> ScopeError {
        ScopeError::CacheDisposed(self.name.clone())
    }
}

/// A scope-keyed memoizing store.
///
/// Owns its entries: dropping the cache disposes it.
pub struct DataCache<T: ?Sized + 'static, F: ScopedDataFactory<T>> {
    shared: Arc<Shared<T, F>>,
}

impl<T: ?Sized + 'static, F: ScopedDataFactory<T>> DataCache<T, F> {
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                factory,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    disposed: false,
                }),
                stats: CacheStats::new(),
                _target: PhantomData,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn stats(&self) -> &CacheStats {
        &self.shared.stats
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.state).disposed
    }

    fn ensure_live(&self) -> ScopeResult<()> {
        if self.is_disposed() {
            return Err(self.shared.disposed_error());
        }
        Ok(())
    }

    /// Run registration passes on `key` until one completes with the key
    /// still valid.
    fn register(&self, target: &T, key: &ScopeKey) -> ScopeResult<KeyIdentity> {
        loop {
            let outcome = self
                .shared
                .factory
                .register_scopes(target, key)
                .and_then(|()| key.identity());
            match outcome {
                Ok(identity) => return Ok(identity),
                Err(ScopeError::KeyInvalid(_)) => {
                    CacheStats::bump(&self.shared.stats.registration_retries);
                    debug!(
                        cache = %self.shared.name,
                        key = key.seq(),
                        "Key invalidated during registration, retrying"
                    );
                    key.reset()?;
                }
                Err(e) => {
                    key.dispose();
                    return Err(e);
                }
            }
        }
    }

    /// Get or create the payload for `target`.
    ///
    /// Returns `Ok(None)` if the factory declares the target uncacheable.
    /// Concurrent callers resolving to the same scope set share a single
    /// creation.
    pub fn get_scoped_data(&self, target: &T) -> ScopeResult<Option<ScopedEntry<F::Data>>> {
        loop {
            self.ensure_live()?;

            let Some(key) = self.shared.factory.create_key(target) else {
                CacheStats::bump(&self.shared.stats.uncacheable);
                return Ok(None);
            };
            let identity = self.register(target, &key)?;

            let resolved = {
                let mut state = lock(&self.shared.state);
                if state.disposed {
                    None
                } else {
                    let existing = match state.entries.get(&identity) {
                        Some(slot) if slot.key.is_valid() => {
                            Some((slot.key.clone(), Arc::clone(&slot.payload)))
                        }
                        _ => None,
                    };
                    Some(match existing {
                        Some((stored, payload)) => (stored, payload, false, None),
                        None => {
                            let stale = state.entries.remove(&identity);
                            let payload = Arc::new(Payload::new());
                            state.entries.insert(
                                identity.clone(),
                                Slot {
                                    key: key.clone(),
                                    payload: Arc::clone(&payload),
                                },
                            );
                            (key.clone(), payload, true, stale)
                        }
                    })
                }
            };

            let Some((stored, payload, inserted, stale)) = resolved else {
                key.dispose();
                return Err(self.shared.disposed_error());
            };

            if let Some(slot) = stale {
                self.shared.evict(slot);
            }

            if inserted {
                let weak = Arc::downgrade(&self.shared);
                let watched = identity.clone();
                let seq = key.seq();
                let subscribed = key.on_invalidated(move |_| {
                    if let Some(shared) = weak.upgrade() {
                        shared.remove_if_current(&watched, seq);
                    }
                });
                // The key may have gone invalid before the handler was in place.
                if subscribed.is_err() || !key.is_valid() {
                    self.shared.remove_if_current(&identity, seq);
                    CacheStats::bump(&self.shared.stats.registration_retries);
                    continue;
                }
                CacheStats::bump(&self.shared.stats.misses);
                debug!(
                    cache = %self.shared.name,
                    operation = "get_scoped_data",
                    status = status::MISS,
                    key = seq,
                    scopes = identity.scope_ids().len(),
                    "Inserted scoped entry"
                );
            } else {
                key.dispose();
                CacheStats::bump(&self.shared.stats.hits);
                debug!(
                    cache = %self.shared.name,
                    operation = "get_scoped_data",
                    status = status::HIT,
                    key = stored.seq(),
                    "Scoped entry found"
                );
            }

            let data = Arc::clone(
                payload
                    .cell
                    .get_or_init(|| Arc::new(self.shared.factory.create_data(target, &stored))),
            );
            // Evicted while the payload was being created.
            if stored.is_disposed() {
                payload.release(|data| self.shared.factory.dispose_data(data));
            }

            return Ok(Some(ScopedEntry { key: stored, data }));
        }
    }

    /// Look up the entry stored under a key equal to `key`. Never creates.
    ///
    /// An invalid `key` matches nothing; an entry whose payload is still
    /// being created is not returned.
    pub fn get_scoped_data_by_key(&self, key: &ScopeKey) -> ScopeResult<Option<ScopedEntry<F::Data>>> {
        let Some(identity) = self.lookup_identity(key)? else {
            return Ok(None);
        };

        let found = {
            let state = lock(&self.shared.state);
            if state.disposed {
                return Err(self.shared.disposed_error());
            }
            state
                .entries
                .get(&identity)
                .filter(|slot| slot.key.is_valid())
                .map(|slot| (slot.key.clone(), Arc::clone(&slot.payload)))
        };

        Ok(found.and_then(|(key, payload)| {
            payload
                .cell
                .get()
                .cloned()
                .map(|data| ScopedEntry { key, data })
        }))
    }

    /// Identity of `key` for a lookup; `None` for an invalid key.
    fn lookup_identity(&self, key: &ScopeKey) -> ScopeResult<Option<KeyIdentity>> {
        self.ensure_live()?;
        match key.identity() {
            Ok(identity) => Ok(Some(identity)),
            Err(ScopeError::KeyInvalid(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Evict every entry, retiring the cache if `retire` is set. `None` if
    /// the cache was already disposed.
    fn drain(&self, retire: bool) -> Option<usize> {
        let drained: Vec<Slot<F::Data>> = {
            let mut state = lock(&self.shared.state);
            if state.disposed {
                return None;
            }
            state.disposed = retire;
            state.entries.drain().map(|(_, slot)| slot).collect()
        };

        let count = drained.len();
        for slot in drained {
            self.shared.evict(slot);
        }
        Some(count)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn invalidate(&self) -> ScopeResult<usize> {
        let count = self.drain(false).ok_or_else(|| self.shared.disposed_error())?;
        info!(cache = %self.shared.name, entry_count = count, "Data cache invalidated");
        Ok(count)
    }

    /// Drop only the entry stored under a key equal to `key`.
    pub fn invalidate_key(&self, key: &ScopeKey) -> ScopeResult<bool> {
        let Some(identity) = self.lookup_identity(key)? else {
            return Ok(false);
        };

        let removed = {
            let mut state = lock(&self.shared.state);
            if state.disposed {
                return Err(self.shared.disposed_error());
            }
            state.entries.remove(&identity)
        };

        match removed {
            Some(slot) => {
                self.shared.evict(slot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispose every stored entry and refuse further use. Idempotent.
    pub fn dispose(&self) {
        if let Some(count) = self.drain(true) {
            info!(cache = %self.shared.name, entry_count = count, "Data cache disposed");
        }
    }

    /// Every live entry whose payload has been created.
    pub(crate) fn entries(&self) -> Vec<ScopedEntry<F::Data>> {
        let state = lock(&self.shared.state);
        state
            .entries
            .values()
            .filter(|slot| slot.key.is_valid())
            .filter_map(|slot| {
                slot.payload.cell.get().map(|data| ScopedEntry {
                    key: slot.key.clone(),
                    data: Arc::clone(data),
                })
            })
            .collect()
    }
}

impl<T: ?Sized + 'static, F: ScopedDataFactory<T>> Drop for DataCache<T, F> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: ?Sized + 'static, F: ScopedDataFactory<T>> fmt::Debug for DataCache<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCache")
            .field("name", &self.shared.name)
            .field("entries", &self.len())
            .finish()
    }
}

impl<T: ?Sized + 'static, F: ScopedDataFactory<T>> Maintainable for DataCache<T, F> {
    /// Sweep entries whose key went invalid without the entry being removed.
    fn maintain(&self) -> MaintenanceReport {
        let (stale, live) = {
            let mut state = lock(&self.shared.state);
            let ids: Vec<KeyIdentity> = state
                .entries
                .iter()
                .filter(|(_, slot)| !slot.key.is_valid())
                .map(|(identity, _)| identity.clone())
                .collect();
            let stale: Vec<Slot<F::Data>> = ids
                .iter()
                .filter_map(|identity| state.entries.remove(identity))
                .collect();
            (stale, state.entries.len())
        };

        let reclaimed = stale.len();
        for slot in stale {
            self.shared.evict(slot);
        }
        MaintenanceReport {
            target: self.shared.name.clone(),
            reclaimed,
            live,
        }
    }
}
