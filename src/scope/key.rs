//! Scope keys: the set of scopes a computation depended on.

use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::signal::{Signal, SubscriptionId};
use super::Scope;
use crate::error::{ScopeError, ScopeResult};
use crate::sync::lock;

static NEXT_KEY_SEQ: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`ScopeKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Usable as a cache identity.
    Valid,
    /// One of its scopes started invalidating it; in-flight operations still
    /// treat it as current.
    Invalidating,
    /// Terminal until [`ScopeKey::reset`].
    Invalidated,
    /// Terminal.
    Disposed,
}

/// An immutable snapshot of a valid key's scope set, usable as a map key.
///
/// Equal snapshots mean the keys they were taken from were equal at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIdentity {
    hash: u64,
    scopes: Box<[u64]>,
}

impl KeyIdentity {
    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    pub fn scope_ids(&self) -> &[u64] {
        &self.scopes
    }
}

impl Hash for KeyIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// The combination of scopes a cached computation depended on.
///
/// Clones share the same key. Two keys compare equal iff both are valid and
/// hold exactly the same scopes; an invalid key is not even equal to itself.
#[derive(Clone)]
pub struct ScopeKey {
    inner: Arc<KeyInner>,
}

pub(super) struct KeyInner {
    seq: u64,
    /// Main lock: scope set, hash and owned resources.
    data: Mutex<KeyData>,
    /// Narrow lock nested inside `data`; only ever held for flag access.
    flags: Mutex<KeyFlags>,
    invalidated: Signal<ScopeKey>,
    registrars_invalidated: Signal<ScopeKey>,
}

#[derive(Default)]
struct KeyData {
    scopes: BTreeMap<u64, Scope>,
    hash: u64,
    owned: Vec<Arc<dyn Any + Send + Sync>>,
    owns_self: bool,
}

#[derive(Debug, Clone, Copy)]
struct KeyFlags {
    valid: bool,
    invalidating: bool,
    disposed: bool,
}

impl KeyFlags {
    fn state(&self) -> KeyState {
        if self.disposed {
            KeyState::Disposed
        } else if !self.valid {
            KeyState::Invalidated
        } else if self.invalidating {
            KeyState::Invalidating
        } else {
            KeyState::Valid
        }
    }
}

impl Default for ScopeKey {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeKey {
    /// Create an empty, valid key.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(KeyInner {
                seq: NEXT_KEY_SEQ.fetch_add(1, Ordering::Relaxed),
                data: Mutex::new(KeyData::default()),
                flags: Mutex::new(KeyFlags {
                    valid: true,
                    invalidating: false,
                    disposed: false,
                }),
                invalidated: Signal::new(),
                registrars_invalidated: Signal::new(),
            }),
        }
    }

    /// Monotonic sequence number, also used to order lock acquisition.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn state(&self) -> KeyState {
        lock(&self.inner.flags).state()
    }

    /// True while the key is valid, including while it is invalidating.
    pub fn is_valid(&self) -> bool {
        let flags = lock(&self.inner.flags);
        flags.valid && !flags.disposed
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner.flags).disposed
    }

    /// Register this key on `scope`. Shorthand for [`Scope::register_key`].
    pub fn register(&self, scope: &Scope) -> ScopeResult<bool> {
        scope.register_key(self)
    }

    /// Register this key on every scope in `scopes`.
    pub fn register_all<'a>(&self, scopes: impl IntoIterator<Item = &'a Scope>) -> ScopeResult<()> {
        for scope in scopes {
            scope.register_key(self)?;
        }
        Ok(())
    }

    /// Record `scope` in this key and the key in `scope`.
    ///
    /// Takes the key's main lock first and the scope's lock second.
    pub(super) fn register_scope(&self, scope: &Scope) -> ScopeResult<bool> {
        let mut data = lock(&self.inner.data);
        {
            let flags = lock(&self.inner.flags);
            if flags.disposed {
                return Err(ScopeError::KeyDisposed(self.inner.seq));
            }
            if !flags.valid || flags.invalidating {
                return Err(ScopeError::KeyInvalid(self.inner.seq));
            }
        }

        if data.scopes.contains_key(&scope.id()) {
            return Ok(false);
        }

        scope.attach_key(self)?;
        data.scopes.insert(scope.id(), scope.clone());
        // Commutative fold: registration order never changes the hash.
        data.hash = data.hash.wrapping_add(scope.seed());
        Ok(true)
    }

    pub(super) fn downgrade(&self) -> Weak<KeyInner> {
        Arc::downgrade(&self.inner)
    }

    pub(super) fn upgrade(weak: &Weak<KeyInner>) -> Option<ScopeKey> {
        weak.upgrade().map(|inner| ScopeKey { inner })
    }

    /// First phase of a scope-driven invalidation. Flag lock only.
    pub(super) fn mark_invalidating(&self) {
        let mut flags = lock(&self.inner.flags);
        if flags.valid && !flags.disposed {
            flags.invalidating = true;
        }
    }

    pub(super) fn notify_registrars(&self) {
        if self.is_valid() {
            self.inner.registrars_invalidated.emit(self);
        }
    }

    pub fn scope_count(&self) -> usize {
        lock(&self.inner.data).scopes.len()
    }

    pub fn scopes(&self) -> Vec<Scope> {
        lock(&self.inner.data).scopes.values().cloned().collect()
    }

    pub fn contains(&self, scope: &Scope) -> bool {
        lock(&self.inner.data).scopes.contains_key(&scope.id())
    }

    /// Order-independent hash of the registered scope set.
    pub fn hash_code(&self) -> u64 {
        lock(&self.inner.data).hash
    }

    /// Snapshot the scope set for use as a map key.
    pub fn identity(&self) -> ScopeResult<KeyIdentity> {
        let data = lock(&self.inner.data);
        {
            let flags = lock(&self.inner.flags);
            if flags.disposed {
                return Err(ScopeError::KeyDisposed(self.inner.seq));
            }
            if !flags.valid {
                return Err(ScopeError::KeyInvalid(self.inner.seq));
            }
        }
        Ok(KeyIdentity {
            hash: data.hash,
            scopes: data.scopes.keys().copied().collect(),
        })
    }

    /// SHA-256 over the sorted scope ids, hex encoded.
    pub fn fingerprint(&self) -> String {
        let data = lock(&self.inner.data);
        let mut hasher = Sha256::new();
        for id in data.scopes.keys() {
            hasher.update(id.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Invalidate the key. Idempotent.
    ///
    /// Detaches from every scope, notifies invalidation subscribers, then
    /// releases owned resources. A self-owned key disposes itself last.
    pub fn invalidate(&self) {
        let (owned, owns_self) = {
            let mut data = lock(&self.inner.data);
            {
                let mut flags = lock(&self.inner.flags);
                if !flags.valid {
                    return;
                }
                flags.valid = false;
                flags.invalidating = false;
            }
            for scope in data.scopes.values() {
                scope.detach_key(self);
            }
            (mem::take(&mut data.owned), mem::replace(&mut data.owns_self, false))
        };

        self.inner.invalidated.emit(self);
        drop(owned);

        if owns_self {
            self.dispose();
        }
    }

    /// Return the key to the empty, valid state so it can be reused for a
    /// new registration pass.
    ///
    /// Subscribers are kept. If the key was still valid they are notified,
    /// since whatever was derived from the old registration no longer holds.
    pub fn reset(&self) -> ScopeResult<()> {
        let (owned, was_valid) = {
            let mut data = lock(&self.inner.data);
            let was_valid = {
                let mut flags = lock(&self.inner.flags);
                if flags.disposed {
                    return Err(ScopeError::KeyDisposed(self.inner.seq));
                }
                let was_valid = flags.valid;
                flags.valid = true;
                flags.invalidating = false;
                was_valid
            };
            for scope in data.scopes.values() {
                scope.detach_key(self);
            }
            data.scopes.clear();
            data.hash = 0;
            data.owns_self = false;
            (mem::take(&mut data.owned), was_valid)
        };

        if was_valid {
            self.inner.invalidated.emit(self);
        }
        drop(owned);
        Ok(())
    }

    /// Invalidate and permanently retire the key. Idempotent.
    pub fn dispose(&self) {
        let (owned, notify) = {
            let mut data = lock(&self.inner.data);
            let notify = {
                let mut flags = lock(&self.inner.flags);
                if flags.disposed {
                    return;
                }
                let notify = flags.valid;
                flags.valid = false;
                flags.invalidating = false;
                flags.disposed = true;
                notify
            };
            for scope in data.scopes.values() {
                scope.detach_key(self);
            }
            data.owns_self = false;
            (mem::take(&mut data.owned), notify)
        };

        if notify {
            self.inner.invalidated.emit(self);
        }
        drop(owned);
        self.inner.invalidated.clear();
        self.inner.registrars_invalidated.clear();
    }

    /// Attach a resource that is released (dropped) when the key becomes
    /// invalid.
    ///
    /// Returns `Ok(false)` if the key is already invalid, in which case the
    /// resource is released immediately.
    pub fn take_ownership<R: Any + Send + Sync>(&self, resource: R) -> ScopeResult<bool> {
        let mut data = lock(&self.inner.data);
        let flags = *lock(&self.inner.flags);

        if flags.disposed {
            drop(data);
            drop(resource);
            return Err(ScopeError::KeyDisposed(self.inner.seq));
        }
        if !flags.valid {
            drop(data);
            drop(resource);
            return Ok(false);
        }

        data.owned.push(Arc::new(resource));
        Ok(true)
    }

    /// First owned resource of type `R`, if any.
    pub fn owned<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        lock(&self.inner.data)
            .owned
            .iter()
            .find_map(|resource| Arc::clone(resource).downcast::<R>().ok())
    }

    /// Make the key dispose itself once it becomes invalid.
    pub fn take_self_ownership(&self) -> ScopeResult<()> {
        {
            let mut data = lock(&self.inner.data);
            let flags = *lock(&self.inner.flags);
            if flags.disposed {
                return Err(ScopeError::KeyDisposed(self.inner.seq));
            }
            if flags.valid {
                data.owns_self = true;
                return Ok(());
            }
        }
        self.dispose();
        Ok(())
    }

    /// Subscribe to the key becoming invalid.
    pub fn on_invalidated(
        &self,
        handler: impl Fn(&ScopeKey) + Send + Sync + 'static,
    ) -> ScopeResult<SubscriptionId> {
        self.subscribe(&self.inner.invalidated, handler)
    }

    /// Subscribe to registrar invalidation on any of the key's scopes.
    pub fn on_registrars_invalidated(
        &self,
        handler: impl Fn(&ScopeKey) + Send + Sync + 'static,
    ) -> ScopeResult<SubscriptionId> {
        self.subscribe(&self.inner.registrars_invalidated, handler)
    }

    fn subscribe(
        &self,
        signal: &Signal<ScopeKey>,
        handler: impl Fn(&ScopeKey) + Send + Sync + 'static,
    ) -> ScopeResult<SubscriptionId> {
        if self.is_disposed() {
            return Err(ScopeError::KeyDisposed(self.inner.seq));
        }
        Ok(signal.subscribe(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.invalidated.unsubscribe(id) || self.inner.registrars_invalidated.unsubscribe(id)
    }

    pub fn ptr_eq(&self, other: &ScopeKey) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for ScopeKey {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return self.is_valid();
        }

        let (first, second) = if self.inner.seq < other.inner.seq {
            (self, other)
        } else {
            (other, self)
        };
        let first_data = lock(&first.inner.data);
        let second_data = lock(&second.inner.data);

        if !first.is_valid() || !second.is_valid() {
            return false;
        }

        first_data.hash == second_data.hash
            && first_data.scopes.len() == second_data.scopes.len()
            && first_data.scopes.keys().eq(second_data.scopes.keys())
    }
}

impl fmt::Debug for ScopeKey {
    // Flags only: formatting must not take the main lock.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeKey")
            .field("seq", &self.inner.seq)
            .field("state", &self.state())
            .finish()
    }
}
