//! Scopes and scope keys
//!
//! A [`Scope`] is a named invalidation domain. A [`ScopeKey`] collects the
//! scopes a computation depended on and is used as that computation's cache
//! identity: two valid keys holding the same set of scopes are equal, no
//! matter in which order the scopes were registered.
//!
//! ## Invalidation
//!
//! - [`Scope::invalidate`]: the scope's content changed. Every registered key
//!   becomes invalid, and everything cached under those keys is dropped.
//! - [`Scope::invalidate_registrars`]: the set of scopes some target belongs
//!   to may have changed. Registered keys stay valid; only their registrar
//!   subscribers are told to redo their scope decision.
//!
//! ## Lock ordering
//!
//! - A key's main lock is taken before a scope's lock, never the reverse.
//! - Two key locks are taken lowest sequence number first.
//! - A key's flag lock is innermost: it is only held for flag reads/writes.
//!
//! [`Scope::invalidate`] honours these rules by detaching its keys under its
//! own lock and finishing their invalidation only after releasing it.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error};

use crate::error::{ScopeError, ScopeResult};
use crate::sync::lock;

mod key;
mod signal;

pub use key::{KeyIdentity, KeyState, ScopeKey};
pub use signal::SubscriptionId;

use key::KeyInner;
use signal::Signal;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Spread a scope id over 64 bits so the commutative fold in keys mixes well.
fn mix(id: u64) -> u64 {
    let mut z = id.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// A named invalidation domain.
///
/// `Scope` is a cheap handle: clones refer to the same scope, and equality is
/// reference identity.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: u64,
    seed: u64,
    name: String,
    state: Mutex<ScopeState>,
    invalidated: Signal<Scope>,
    registrars_invalidated: Signal<Scope>,
}

#[derive(Default)]
struct ScopeState {
    keys: HashMap<u64, Weak<KeyInner>>,
    disposed: bool,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(ScopeInner {
                id,
                seed: mix(id),
                name: name.into(),
                state: Mutex::new(ScopeState::default()),
                invalidated: Signal::new(),
                registrars_invalidated: Signal::new(),
            }),
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Process-unique id of this scope.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn seed(&self) -> u64 {
        self.inner.seed
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner.state).disposed
    }

    /// Number of live keys currently registered on this scope.
    pub fn key_count(&self) -> usize {
        lock(&self.inner.state)
            .keys
            .values()
            .filter(|key| key.strong_count() > 0)
            .count()
    }

    /// Register `key` on this scope.
    ///
    /// Returns `Ok(false)` if the key was already registered. Fails with
    /// [`ScopeError::KeyInvalid`] if the key is not currently valid (for
    /// instance because another of its scopes is being invalidated), and
    /// with [`ScopeError::ScopeDisposed`] once this scope is torn down.
    ///
    /// Must not be called while holding any scope lock.
    pub fn register_key(&self, key: &ScopeKey) -> ScopeResult<bool> {
        key.register_scope(self)
    }

    /// Called by the key with its main lock held.
    pub(crate) fn attach_key(&self, key: &ScopeKey) -> ScopeResult<bool> {
        let mut state = lock(&self.inner.state);
        if state.disposed {
            return Err(ScopeError::ScopeDisposed(self.inner.name.clone()));
        }

        if state.keys.len() > 64 && state.keys.len().is_power_of_two() {
            state.keys.retain(|_, weak| weak.strong_count() > 0);
        }

        match state.keys.get(&key.seq()) {
            Some(existing) if existing.strong_count() > 0 => Ok(false),
            _ => {
                state.keys.insert(key.seq(), key.downgrade());
                Ok(true)
            }
        }
    }

    /// Called by the key with its main lock held. A missing entry is
    /// expected: an invalidation of this scope may have drained it already.
    pub(crate) fn detach_key(&self, key: &ScopeKey) {
        let mut state = lock(&self.inner.state);
        let Some(existing) = state.keys.remove(&key.seq()) else {
            return;
        };
        if !Weak::ptr_eq(&existing, &key.downgrade()) {
            error!(
                scope = %self.inner.name,
                key = key.seq(),
                "scope holds a different key under this sequence number"
            );
            state.keys.insert(key.seq(), existing);
            debug_assert!(false, "scope '{}' key {} mismatch", self.inner.name, key.seq());
        }
    }

    /// Take every registered key out of the scope and mark it invalidating.
    ///
    /// Runs entirely under the scope lock; the keys' flag locks are innermost
    /// so taking them here cannot deadlock.
    fn detach_all(state: &mut ScopeState) -> Vec<ScopeKey> {
        state
            .keys
            .drain()
            .filter_map(|(_, weak)| ScopeKey::upgrade(&weak))
            .inspect(|key| key.mark_invalidating())
            .collect()
    }

    /// Invalidate all data depending on this scope.
    pub fn invalidate(&self) -> ScopeResult<()> {
        let keys = {
            let mut state = lock(&self.inner.state);
            if state.disposed {
                return Err(ScopeError::ScopeDisposed(self.inner.name.clone()));
            }
            Self::detach_all(&mut state)
        };

        debug!(scope = %self.inner.name, keys = keys.len(), "invalidating scope");

        // Outside the scope lock: each key may wait for its own in-flight
        // operation and then detach from its other scopes.
        for key in &keys {
            key.invalidate();
        }

        self.inner.invalidated.emit(self);
        Ok(())
    }

    /// Tell registrars that scope membership may have changed.
    ///
    /// Registered keys stay valid and stay registered.
    pub fn invalidate_registrars(&self) -> ScopeResult<()> {
        let keys: Vec<ScopeKey> = {
            let state = lock(&self.inner.state);
            if state.disposed {
                return Err(ScopeError::ScopeDisposed(self.inner.name.clone()));
            }
            state.keys.values().filter_map(ScopeKey::upgrade).collect()
        };

        debug!(scope = %self.inner.name, keys = keys.len(), "invalidating scope registrars");

        for key in &keys {
            key.notify_registrars();
        }

        self.inner.registrars_invalidated.emit(self);
        Ok(())
    }

    /// Invalidate every registered key and retire the scope. Idempotent.
    pub fn dispose(&self) {
        let keys = {
            let mut state = lock(&self.inner.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            Self::detach_all(&mut state)
        };

        debug!(scope = %self.inner.name, keys = keys.len(), "disposing scope");

        for key in &keys {
            key.invalidate();
        }

        self.inner.invalidated.emit(self);
        self.inner.invalidated.clear();
        self.inner.registrars_invalidated.clear();
    }

    /// Subscribe to this scope's invalidation.
    ///
    /// The handler runs after every registered key has been invalidated.
    pub fn on_invalidated(
        &self,
        handler: impl Fn(&Scope) + Send + Sync + 'static,
    ) -> ScopeResult<SubscriptionId> {
        self.ensure_live()?;
        Ok(self.inner.invalidated.subscribe(handler))
    }

    pub fn on_registrars_invalidated(
        &self,
        handler: impl Fn(&Scope) + Send + Sync + 'static,
    ) -> ScopeResult<SubscriptionId> {
        self.ensure_live()?;
        Ok(self.inner.registrars_invalidated.subscribe(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.invalidated.unsubscribe(id) || self.inner.registrars_invalidated.unsubscribe(id)
    }

    fn ensure_live(&self) -> ScopeResult<()> {
        if self.is_disposed() {
            return Err(ScopeError::ScopeDisposed(self.inner.name.clone()));
        }
        Ok(())
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.name, self.inner.id)
    }
}
