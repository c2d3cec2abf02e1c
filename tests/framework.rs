//! End-to-end behavior of scopes, keys and the caches built on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use scopeline::{
    DataCache, DataProcessor, Processed, ProcessorCache, Scope, ScopeError, ScopeKey,
    ScopeResult, ScopedDataFactory,
};

/// Counts drops so tests can assert exactly-once release.
struct Released(Arc<AtomicUsize>);

impl Drop for Released {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory registering `base`, plus `extra` while `with_extra` is set, plus
/// a scope of the target's own when built with `per_target`.
struct MembershipFactory {
    base: Scope,
    extra: Scope,
    with_extra: AtomicBool,
    targets: Option<Mutex<HashMap<String, Scope>>>,
    created: AtomicUsize,
    disposed: AtomicUsize,
    create_delay: Duration,
}

impl MembershipFactory {
    fn new(base: &Scope, extra: &Scope) -> Self {
        Self {
            base: base.clone(),
            extra: extra.clone(),
            with_extra: AtomicBool::new(false),
            targets: None,
            created: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
        }
    }

    fn per_target(mut self) -> Self {
        self.targets = Some(Mutex::new(HashMap::new()));
        self
    }

    fn target_scope(&self, target: &str) -> Option<Scope> {
        let targets = self.targets.as_ref()?;
        let mut targets = targets.lock().unwrap();
        Some(
            targets
                .entry(target.to_string())
                .or_insert_with(|| Scope::new(target))
                .clone(),
        )
    }
}

impl ScopedDataFactory<str> for MembershipFactory {
    type Data = String;

    fn register_scopes(&self, target: &str, key: &ScopeKey) -> ScopeResult<()> {
        key.register(&self.base)?;
        if self.with_extra.load(Ordering::SeqCst) {
            key.register(&self.extra)?;
        }
        if let Some(scope) = self.target_scope(target) {
            key.register(&scope)?;
        }
        Ok(())
    }

    fn create_data(&self, target: &str, key: &ScopeKey) -> String {
        if !self.create_delay.is_zero() {
            thread::sleep(self.create_delay);
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}#{}/{}", target, n, key.scope_count())
    }

    fn dispose_data(&self, _data: &String) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Processor that registers one scope and counts its invocations.
struct CountingProcessor {
    scope: Scope,
    calls: AtomicUsize,
}

impl DataProcessor<str, u32, String> for CountingProcessor {
    fn register_scopes(&self, _target: &str, key: &ScopeKey) -> ScopeResult<()> {
        key.register(&self.scope)?;
        Ok(())
    }

    fn process_data(
        &self,
        target: &str,
        _key: Option<&ScopeKey>,
        id: &u32,
        data: String,
    ) -> anyhow::Result<Processed<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Processed::modified(format!("{}:{}:{}", data, target, id)))
    }
}

#[test]
fn test_key_equality_ignores_registration_order() {
    let a = Scope::new("a");
    let b = Scope::new("b");

    let first = ScopeKey::new();
    first.register(&a).unwrap();
    first.register(&b).unwrap();

    let second = ScopeKey::new();
    second.register(&b).unwrap();
    second.register(&a).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.hash_code(), second.hash_code());
    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_eq!(first.identity().unwrap(), second.identity().unwrap());

    let only_a = ScopeKey::new();
    only_a.register(&a).unwrap();
    assert_ne!(first, only_a);
}

#[test]
fn test_invalid_keys_are_never_equal() {
    let a = Scope::new("a");
    let first = ScopeKey::new();
    let second = ScopeKey::new();
    first.register(&a).unwrap();
    second.register(&a).unwrap();
    assert_eq!(first, second);

    a.invalidate().unwrap();
    assert!(!first.is_valid());
    assert_ne!(first, second);
    assert_ne!(first, first.clone());
}

#[test]
fn test_invalidation_cascades_to_processor_cache() {
    let scope = Scope::new("palette");
    let processor = Arc::new(CountingProcessor {
        scope: scope.clone(),
        calls: AtomicUsize::new(0),
    });
    let cache = ProcessorCache::new("counting", Arc::clone(&processor));

    let first = cache.process("hero", 1, "frame".to_string()).unwrap();
    let second = cache.process("hero", 1, "frame".to_string()).unwrap();
    assert_eq!(first, second);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);

    scope.invalidate().unwrap();
    assert!(cache.is_empty());

    cache.process("hero", 1, "frame".to_string()).unwrap();
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_lookups_share_one_creation() {
    const CALLERS: usize = 16;

    let base = Scope::new("base");
    let extra = Scope::new("extra");
    let mut factory = MembershipFactory::new(&base, &extra);
    factory.create_delay = Duration::from_millis(50);
    let cache: DataCache<str, _> = DataCache::new("single-flight", factory);
    let barrier = Barrier::new(CALLERS);

    let payloads: Vec<Arc<String>> = thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_scoped_data("hero").unwrap().unwrap().into_data()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(cache.factory().created.load(Ordering::SeqCst), 1);
    assert!(payloads.iter().all(|p| Arc::ptr_eq(p, &payloads[0])));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_registrar_invalidation_keeps_entries() {
    let base = Scope::new("base");
    let extra = Scope::new("extra");
    let cache: DataCache<str, _> = DataCache::new("membership", MembershipFactory::new(&base, &extra));

    let before = cache.get_scoped_data("hero").unwrap().unwrap();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    before
        .key()
        .on_registrars_invalidated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    base.invalidate_registrars().unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(before.key().is_valid());
    assert_eq!(cache.len(), 1);

    let again = cache.get_scoped_data("hero").unwrap().unwrap();
    assert!(Arc::ptr_eq(before.data(), again.data()));

    // Membership changed: the target now lands under a different key while
    // the old entry stays put.
    cache.factory().with_extra.store(true, Ordering::SeqCst);
    let after = cache.get_scoped_data("hero").unwrap().unwrap();
    assert_ne!(before.key(), after.key());
    assert!(!Arc::ptr_eq(before.data(), after.data()));
    assert!(before.key().is_valid());
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_disposal_is_idempotent() {
    let scope = Scope::new("level");
    let key = ScopeKey::new();
    key.register(&scope).unwrap();

    let cache: DataCache<str, _> = DataCache::new(
        "dispose",
        MembershipFactory::new(&scope, &Scope::new("unused")),
    );
    cache.get_scoped_data("hero").unwrap();

    scope.dispose();
    scope.dispose();
    assert!(scope.is_disposed());
    assert!(!key.is_valid());
    assert!(cache.is_empty());
    assert!(matches!(scope.invalidate(), Err(ScopeError::ScopeDisposed(_))));

    key.dispose();
    key.dispose();
    assert!(matches!(key.reset(), Err(ScopeError::KeyDisposed(_))));

    cache.dispose();
    cache.dispose();
    assert!(matches!(
        cache.get_scoped_data("hero"),
        Err(ScopeError::CacheDisposed(_))
    ));
    assert_eq!(
        cache.factory().created.load(Ordering::SeqCst),
        cache.factory().disposed.load(Ordering::SeqCst)
    );
}

#[test]
fn test_owned_resource_released_once() {
    let scope = Scope::new("level");
    let released = Arc::new(AtomicUsize::new(0));
    let key = ScopeKey::new();
    key.register(&scope).unwrap();
    assert!(key.take_ownership(Released(Arc::clone(&released))).unwrap());
    assert_eq!(released.load(Ordering::SeqCst), 0);

    scope.invalidate().unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 1);

    key.invalidate();
    key.reset().unwrap();
    key.dispose();
    key.dispose();
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_payload_disposed_once() {
    let base = Scope::new("base");
    let extra = Scope::new("extra");
    let cache: DataCache<str, _> = DataCache::new("release", MembershipFactory::new(&base, &extra));

    let entry = cache.get_scoped_data("hero").unwrap().unwrap();
    cache.factory().with_extra.store(true, Ordering::SeqCst);
    cache.get_scoped_data("hero").unwrap();
    assert_eq!(cache.factory().created.load(Ordering::SeqCst), 2);

    base.invalidate().unwrap();
    assert!(!entry.key().is_valid());
    assert_eq!(cache.factory().disposed.load(Ordering::SeqCst), 2);

    cache.invalidate().unwrap();
    cache.dispose();
    assert_eq!(cache.factory().disposed.load(Ordering::SeqCst), 2);
}

/// Answers "red" for "color" while the player scope is registered.
struct PlayerColor {
    global: Scope,
    player: Scope,
    player_active: AtomicBool,
    calls: AtomicUsize,
}

impl DataProcessor<(), String, String> for PlayerColor {
    fn register_scopes(&self, _target: &(), key: &ScopeKey) -> ScopeResult<()> {
        key.register(&self.global)?;
        if self.player_active.load(Ordering::SeqCst) {
            key.register(&self.player)?;
        }
        Ok(())
    }

    fn process_data(
        &self,
        _target: &(),
        key: Option<&ScopeKey>,
        id: &String,
        data: String,
    ) -> anyhow::Result<Processed<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if id != "color" {
            return Ok(Processed::unchanged(data));
        }
        let with_player = key.is_some_and(|key| key.contains(&self.player));
        let color = if with_player { "red" } else { "blue" };
        Ok(Processed::modified(color.to_string()))
    }
}

#[test]
fn test_player_scope_scenario() {
    let global = Scope::new("G");
    let player = Scope::new("P");
    let processor = Arc::new(PlayerColor {
        global: global.clone(),
        player: player.clone(),
        player_active: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });
    let cache = ProcessorCache::new("player-color", Arc::clone(&processor));

    let red = cache.process(&(), "color".to_string(), String::new()).unwrap();
    assert_eq!(red.data, "red");
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

    let again = cache.process(&(), "color".to_string(), String::new()).unwrap();
    assert_eq!(again.data, "red");
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

    processor.player_active.store(false, Ordering::SeqCst);
    player.invalidate().unwrap();

    let blue = cache.process(&(), "color".to_string(), String::new()).unwrap();
    assert_eq!(blue.data, "blue");
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalidation_races_with_lookups() {
    use rand::Rng;

    let base = Scope::new("base");
    let extra = Scope::new("extra");
    let cache: DataCache<str, _> =
        DataCache::new("race", MembershipFactory::new(&base, &extra).per_target());
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut rng = rand::rng();
                while !stop.load(Ordering::SeqCst) {
                    let target = format!("sprite-{}", rng.random_range(0..8));
                    let entry = cache.get_scoped_data(&target).unwrap().unwrap();
                    assert!(entry.data().starts_with(&format!("{}#", target)));
                }
            });
        }

        s.spawn(|| {
            let mut rng = rand::rng();
            for _ in 0..200 {
                if rng.random_bool(0.3) {
                    base.invalidate().unwrap();
                } else if rng.random_bool(0.5) {
                    let target = format!("sprite-{}", rng.random_range(0..8));
                    if let Some(scope) = cache.factory().target_scope(&target) {
                        scope.invalidate().unwrap();
                    }
                } else {
                    let flag = &cache.factory().with_extra;
                    flag.store(!flag.load(Ordering::SeqCst), Ordering::SeqCst);
                    extra.invalidate().unwrap();
                }
            }
            stop.store(true, Ordering::SeqCst);
        });
    });

    base.invalidate().unwrap();
    extra.invalidate().unwrap();
    assert!(cache.is_empty());

    cache.dispose();
    let factory = cache.factory();
    assert_eq!(
        factory.created.load(Ordering::SeqCst),
        factory.disposed.load(Ordering::SeqCst)
    );
}
