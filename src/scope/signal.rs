//! Subscriber lists for scope and key notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// Handle returned by a subscription; pass it back to unsubscribe.
pub type SubscriptionId = u64;

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A list of callbacks fired on a state transition.
///
/// Handlers are cloned out of the list before being invoked, so a handler
/// runs with no lock held and may subscribe or unsubscribe freely.
pub(crate) struct Signal<A: ?Sized> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<A>)>>,
}

impl<A: ?Sized> Signal<A> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, handler: impl Fn(&A) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).push((id, Arc::new(handler)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub(crate) fn emit(&self, arg: &A) {
        let handlers: Vec<Handler<A>> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(arg);
        }
    }

    pub(crate) fn clear(&self) {
        lock(&self.handlers).clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.handlers).len()
    }
}
