//! Ordered processor chains.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error};

use super::{DataProcessor, Processed};
use crate::error::ScopeResult;
use crate::maintenance::{Maintainable, MaintenanceReport};
use crate::scope::ScopeKey;

/// Handle to a processor added to a composite; removes it again.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    removed: Arc<AtomicBool>,
    pending: Weak<AtomicUsize>,
}

impl ProcessorHandle {
    /// Remove the processor from its chain. Returns false if it was already
    /// removed.
    ///
    /// Constant time: the entry is only flagged here and skipped by later
    /// traversals; the chain drops it on its next compaction.
    pub fn remove(&self) -> bool {
        // Counted before flagging: a compaction that sees the flag also sees
        // the count.
        let pending = self.pending.upgrade();
        if let Some(pending) = &pending {
            pending.fetch_add(1, Ordering::AcqRel);
        }
        if self.removed.swap(true, Ordering::AcqRel) {
            if let Some(pending) = &pending {
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            return false;
        }
        true
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

pub(super) struct Entry<P: ?Sized> {
    priority: i32,
    removed: Arc<AtomicBool>,
    processor: Arc<P>,
}

impl<P: ?Sized> Entry<P> {
    fn is_live(&self) -> bool {
        !self.removed.load(Ordering::Acquire)
    }
}

type Entries<P> = Arc<Vec<Arc<Entry<P>>>>;

/// Priority-ordered list shared by the sync and async composites.
///
/// Traversals work on a copy-on-write snapshot and bump a usage counter;
/// removed entries are only compacted out once no traversal is running.
pub(super) struct ProcessorList<P: ?Sized> {
    name: String,
    entries: RwLock<Entries<P>>,
    usage: AtomicUsize,
    pending: Arc<AtomicUsize>,
}

impl<P: ?Sized> ProcessorList<P> {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Arc::new(Vec::new())),
            usage: AtomicUsize::new(0),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> Entries<P> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&entries)
    }

    /// Insert keeping ascending priority; equal priorities keep insertion
    /// order.
    pub(super) fn add(&self, priority: i32, processor: Arc<P>) -> ProcessorHandle {
        let removed = Arc::new(AtomicBool::new(false));
        let entry = Arc::new(Entry {
            priority,
            removed: Arc::clone(&removed),
            processor,
        });

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let position = entries.partition_point(|existing| existing.priority <= priority);
            let mut next = Vec::with_capacity(entries.len() + 1);
            next.extend(entries[..position].iter().cloned());
            next.push(entry);
            next.extend(entries[position..].iter().cloned());
            *entries = Arc::new(next);
        }

        ProcessorHandle {
            removed,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Start a traversal.
    pub(super) fn traverse(&self) -> Traversal<'_, P> {
        self.usage.fetch_add(1, Ordering::AcqRel);
        Traversal {
            list: self,
            entries: self.current(),
        }
    }

    /// Drop removed entries if no traversal is running. Returns how many
    /// entries were dropped.
    pub(super) fn compact(&self) -> usize {
        if self.pending.load(Ordering::Acquire) == 0 {
            return 0;
        }
        self.compact_now()
    }

    /// Compact regardless of the pending counter (still never while a
    /// traversal is running).
    pub(super) fn compact_now(&self) -> usize {
        if self.usage.load(Ordering::Acquire) != 0 {
            return 0;
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if self.usage.load(Ordering::Acquire) != 0 {
            return 0;
        }
        let live: Vec<_> = entries.iter().filter(|entry| entry.is_live()).cloned().collect();
        let dropped = entries.len() - live.len();
        if dropped == 0 {
            return 0;
        }
        *entries = Arc::new(live);
        drop(entries);

        // A removal racing this pass may be counted but not dropped yet; it
        // is picked up by the next compaction.
        let settled = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                pending.checked_sub(dropped)
            });
        if let Err(pending) = settled {
            error!(
                composite = %self.name,
                dropped,
                pending,
                "dropped more removed processors than were counted"
            );
            debug_assert!(false, "pending removal counter underflow in '{}'", self.name);
            self.pending.store(0, Ordering::Release);
        }
        debug!(composite = %self.name, dropped, "compacted processor chain");
        dropped
    }

    pub(super) fn len(&self) -> usize {
        self.current().iter().filter(|entry| entry.is_live()).count()
    }

    pub(super) fn maintain(&self) -> MaintenanceReport {
        MaintenanceReport {
            target: self.name.clone(),
            reclaimed: self.compact_now(),
            live: self.len(),
        }
    }
}

/// A running traversal over a snapshot of the list.
pub(super) struct Traversal<'a, P: ?Sized> {
    list: &'a ProcessorList<P>,
    entries: Entries<P>,
}

impl<P: ?Sized> Traversal<'_, P> {
    /// Live processors in priority order. An entry removed mid-traversal is
    /// skipped from then on.
    pub(super) fn processors(&self) -> impl Iterator<Item = &Arc<P>> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.processor)
    }
}

impl<P: ?Sized> Drop for Traversal<'_, P> {
    fn drop(&mut self) {
        if self.list.usage.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.list.compact();
        }
    }
}

/// An ordered chain of processors presented as a single processor.
///
/// Each stage receives the previous stage's output; the chain reports
/// `modified` if any stage did.
pub struct CompositeDataProcessor<T: ?Sized, I: ?Sized, D> {
    list: ProcessorList<dyn DataProcessor<T, I, D>>,
}

impl<T: ?Sized, I: ?Sized, D> CompositeDataProcessor<T, I, D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            list: ProcessorList::new(name),
        }
    }

    pub fn add_processor(
        &self,
        priority: i32,
        processor: Arc<dyn DataProcessor<T, I, D>>,
    ) -> ProcessorHandle {
        self.list.add(priority, processor)
    }

    /// Number of live processors.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn compact(&self) -> usize {
        self.list.compact()
    }
}

impl<T: ?Sized, I: ?Sized, D> DataProcessor<T, I, D> for CompositeDataProcessor<T, I, D> {
    fn register_scopes(&self, target: &T, key: &ScopeKey) -> ScopeResult<()> {
        let traversal = self.list.traverse();
        for processor in traversal.processors() {
            processor.register_scopes(target, key)?;
        }
        Ok(())
    }

    fn process_data(
        &self,
        target: &T,
        key: Option<&ScopeKey>,
        id: &I,
        data: D,
    ) -> anyhow::Result<Processed<D>> {
        let traversal = self.list.traverse();
        let mut modified = false;
        let mut data = data;
        for processor in traversal.processors() {
            let stage = processor.process_data(target, key, id, data)?;
            modified |= stage.modified;
            data = stage.data;
        }
        Ok(Processed { modified, data })
    }
}

impl<T: ?Sized, I: ?Sized, D> Maintainable for CompositeDataProcessor<T, I, D> {
    fn maintain(&self) -> MaintenanceReport {
        self.list.maintain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use std::sync::Mutex;

    /// Appends a tag to the payload.
    struct Append {
        tag: &'static str,
        scope: Option<Scope>,
    }

    impl DataProcessor<(), str, String> for Append {
        fn register_scopes(&self, _target: &(), key: &ScopeKey) -> ScopeResult<()> {
            if let Some(scope) = &self.scope {
                key.register(scope)?;
            }
            Ok(())
        }

        fn process_data(
            &self,
            _target: &(),
            _key: Option<&ScopeKey>,
            _id: &str,
            data: String,
        ) -> anyhow::Result<Processed<String>> {
            Ok(Processed::modified(format!("{}{}", data, self.tag)))
        }
    }

    struct Identity;

    impl DataProcessor<(), str, String> for Identity {
        fn register_scopes(&self, _target: &(), _key: &ScopeKey) -> ScopeResult<()> {
            Ok(())
        }

        fn process_data(
            &self,
            _target: &(),
            _key: Option<&ScopeKey>,
            _id: &str,
            data: String,
        ) -> anyhow::Result<Processed<String>> {
            Ok(Processed::unchanged(data))
        }
    }

    fn append(tag: &'static str) -> Arc<dyn DataProcessor<(), str, String>> {
        Arc::new(Append { tag, scope: None })
    }

    #[test]
    fn test_priority_order_with_insertion_ties() {
        let composite: CompositeDataProcessor<(), str, String> = CompositeDataProcessor::new("test");
        composite.add_processor(10, append("c"));
        composite.add_processor(0, append("a"));
        composite.add_processor(10, append("d"));
        composite.add_processor(5, append("b"));

        let out = composite.process_data(&(), None, "id", String::new()).unwrap();
        assert_eq!(out.data, "abcd");
        assert!(out.modified);
    }

    #[test]
    fn test_unmodified_chain() {
        let composite: CompositeDataProcessor<(), str, String> = CompositeDataProcessor::new("test");
        composite.add_processor(0, Arc::new(Identity));
        composite.add_processor(1, Arc::new(Identity));

        let out = composite.process_data(&(), None, "id", "x".to_string()).unwrap();
        assert_eq!(out, Processed::unchanged("x".to_string()));
    }

    #[test]
    fn test_remove_and_compact() {
        let composite: CompositeDataProcessor<(), str, String> = CompositeDataProcessor::new("test");
        let a = composite.add_processor(0, append("a"));
        composite.add_processor(1, append("b"));

        assert!(a.remove());
        assert!(!a.remove());
        assert!(a.is_removed());
        assert_eq!(composite.len(), 1);

        let out = composite.process_data(&(), None, "id", String::new()).unwrap();
        assert_eq!(out.data, "b");

        // the traversal above compacted on exit
        assert_eq!(composite.compact(), 0);
        let report = composite.maintain();
        assert_eq!(report.live, 1);
    }

    #[test]
    fn test_pending_removals_match_compaction() {
        let composite: CompositeDataProcessor<(), str, String> = CompositeDataProcessor::new("test");
        let a = composite.add_processor(0, append("a"));
        let twin = a.clone();
        composite.add_processor(1, append("b"));

        assert!(a.remove());
        assert!(!twin.remove());
        assert_eq!(composite.list.pending.load(Ordering::Acquire), 1);

        assert_eq!(composite.compact(), 1);
        assert_eq!(composite.list.pending.load(Ordering::Acquire), 0);
        assert_eq!(composite.maintain().reclaimed, 0);
        assert_eq!(composite.list.pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_register_scopes_visits_all_stages() {
        let first = Scope::new("first");
        let second = Scope::new("second");
        let composite: CompositeDataProcessor<(), str, String> = CompositeDataProcessor::new("test");
        composite.add_processor(
            0,
            Arc::new(Append {
                tag: "a",
                scope: Some(first.clone()),
            }),
        );
        composite.add_processor(
            1,
            Arc::new(Append {
                tag: "b",
                scope: Some(second.clone()),
            }),
        );

        let key = ScopeKey::new();
        composite.register_scopes(&(), &key).unwrap();
        assert!(key.contains(&first));
        assert!(key.contains(&second));
    }

    /// Removes a handle (possibly its own) while the chain is running.
    struct RemoveDuringRun {
        handle: Mutex<Option<ProcessorHandle>>,
    }

    impl DataProcessor<(), str, String> for RemoveDuringRun {
        fn register_scopes(&self, _target: &(), _key: &ScopeKey) -> ScopeResult<()> {
            Ok(())
        }

        fn process_data(
            &self,
            _target: &(),
            _key: Option<&ScopeKey>,
            _id: &str,
            data: String,
        ) -> anyhow::Result<Processed<String>> {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                handle.remove();
            }
            Ok(Processed::unchanged(data))
        }
    }

    #[test]
    fn test_removal_during_traversal() {
        let composite: CompositeDataProcessor<(), str, String> = CompositeDataProcessor::new("test");
        let remover = Arc::new(RemoveDuringRun {
            handle: Mutex::new(None),
        });
        composite.add_processor(0, remover.clone());
        let later = composite.add_processor(1, append("z"));
        *remover.handle.lock().unwrap() = Some(later);

        let out = composite.process_data(&(), None, "id", String::new()).unwrap();
        assert_eq!(out.data, "");
        assert_eq!(composite.len(), 1);
    }
}
