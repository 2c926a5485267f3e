//! Correctness Tests for the Instance Cache
//!
//! These tests drive the checkout/check-in protocol through small caches with
//! predictable capacities and check exactly which entries end up available,
//! passivated or discarded, and which listener callbacks fired.
//!
//! ## Test Strategy
//! - Capacities of one to three entries so the LRU pass is deterministic
//! - A recording listener that counts every callback per value
//! - Both the in-memory and the directory passivation stores

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stateful_rs::cache::{CacheListener, EntryState, InstanceCache};
use stateful_rs::config::InstanceCacheConfig;
use stateful_rs::error::{BoxError, CacheError, PassivationError};
use stateful_rs::metrics::Manageable;
use stateful_rs::passivation::{
    DirectoryPassivater, JsonCodec, MemoryPassivater, PassivationStrategy,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// HELPERS
// ============================================================================

/// Listener that records callbacks and can be told to refuse some of them.
#[derive(Default)]
struct Recorder {
    loaded: Mutex<BTreeMap<String, usize>>,
    stored: Mutex<BTreeMap<String, usize>>,
    timed_out: Mutex<BTreeMap<String, usize>>,
    refuse_loads: bool,
    veto: Option<String>,
}

impl Recorder {
    fn count(map: &Mutex<BTreeMap<String, usize>>, value: &str) -> usize {
        map.lock().get(value).copied().unwrap_or(0)
    }

    fn bump(map: &Mutex<BTreeMap<String, usize>>, value: &str) {
        *map.lock().entry(value.to_string()).or_insert(0) += 1;
    }
}

impl CacheListener<String> for Recorder {
    fn after_load(&self, value: &String) -> Result<(), BoxError> {
        Recorder::bump(&self.loaded, value);
        if self.refuse_loads {
            return Err("activation refused".into());
        }
        Ok(())
    }

    fn before_store(&self, value: &String) -> Result<(), BoxError> {
        if self.veto.as_deref() == Some(value.as_str()) {
            return Err("not serializable".into());
        }
        Recorder::bump(&self.stored, value);
        Ok(())
    }

    fn timed_out(&self, value: &String) -> Result<(), BoxError> {
        Recorder::bump(&self.timed_out, value);
        Ok(())
    }
}

fn config(capacity: usize, bulk: usize, timeout: Option<Duration>) -> InstanceCacheConfig {
    InstanceCacheConfig {
        capacity: NonZeroUsize::new(capacity).unwrap(),
        bulk_passivate: bulk,
        timeout,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_cache(
    capacity: usize,
    bulk: usize,
    timeout: Option<Duration>,
    recorder: &Arc<Recorder>,
) -> InstanceCache<u32, String> {
    make_cache_with(config(capacity, bulk, timeout), memory_store(), recorder)
}

fn make_cache_with<P>(
    config: InstanceCacheConfig,
    store: P,
    recorder: &Arc<Recorder>,
) -> InstanceCache<u32, String>
where
    P: PassivationStrategy<u32, String> + 'static,
{
    init_tracing();
    let cache = InstanceCache::init(config, store);
    cache.set_listener(Arc::clone(recorder) as Arc<dyn CacheListener<String>>);
    cache
}

fn memory_store() -> MemoryPassivater<u32, JsonCodec<String>> {
    MemoryPassivater::new(JsonCodec::new())
}

/// Store whose writes fail while `broken` is set.
struct FlakyStore {
    inner: MemoryPassivater<u32, JsonCodec<String>>,
    broken: AtomicBool,
}

impl PassivationStrategy<u32, String> for FlakyStore {
    fn passivate(&self, batch: Vec<(u32, String)>) -> Result<(), PassivationError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.passivate(batch)
    }

    fn activate(&self, key: &u32) -> Result<Option<String>, PassivationError> {
        self.inner.activate(key)
    }
}

#[derive(Default)]
struct Gate {
    storing: AtomicBool,
    release: AtomicBool,
}

/// Store that holds every write open until its gate is released.
struct GatedStore {
    inner: MemoryPassivater<u32, JsonCodec<String>>,
    gate: Arc<Gate>,
}

impl PassivationStrategy<u32, String> for GatedStore {
    fn passivate(&self, batch: Vec<(u32, String)>) -> Result<(), PassivationError> {
        self.gate.storing.store(true, Ordering::SeqCst);
        while !self.gate.release.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        self.inner.passivate(batch)
    }

    fn activate(&self, key: &u32) -> Result<Option<String>, PassivationError> {
        self.inner.activate(key)
    }
}

fn add_available(cache: &InstanceCache<u32, String>, key: u32, value: &str) {
    cache.add(key, value.to_string()).unwrap();
    cache.check_in(&key).unwrap();
}

// ============================================================================
// CHECKOUT PROTOCOL
// ============================================================================

#[test]
fn test_checked_out_entry_is_exclusive() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    add_available(&cache, 1, "one");

    assert_eq!(cache.check_out(&1).unwrap().as_deref(), Some("one"));
    assert!(matches!(
        cache.check_out(&1),
        Err(CacheError::AlreadyCheckedOut(_))
    ));
    assert_eq!(cache.entry_state(&1), Some(EntryState::CheckedOut));
}

#[test]
fn test_add_leaves_entry_checked_out() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);

    cache.add(1, "one".to_string()).unwrap();
    assert!(matches!(
        cache.check_out(&1),
        Err(CacheError::AlreadyCheckedOut(_))
    ));
    assert!(matches!(
        cache.add(1, "again".to_string()),
        Err(CacheError::AlreadyExists(_))
    ));

    cache.check_in(&1).unwrap();
    assert_eq!(cache.check_out(&1).unwrap().as_deref(), Some("one"));
}

#[test]
fn test_repeated_check_in_refreshes_entry() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    add_available(&cache, 1, "one");

    // a second check-in refreshes the idle clock of a queued entry
    cache.check_in(&1).unwrap();
    assert_eq!(cache.available(), 1);

    // unknown keys are ignored
    cache.check_in(&99).unwrap();
}

#[test]
fn test_unknown_key_misses() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    assert!(cache.check_out(&7).unwrap().is_none());
    assert!(cache.remove(&7).is_none());
}

// ============================================================================
// TIMEOUTS
// ============================================================================

#[test]
fn test_zero_timeout_discards_on_lru_pass() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, Some(Duration::ZERO), &recorder);
    add_available(&cache, 1, "one");
    cache.process_lru();

    assert!(cache.check_out(&1).unwrap().is_none());
    assert_eq!(Recorder::count(&recorder.timed_out, "one"), 1);
    assert_eq!(cache.cache_metrics().timeouts(), 1);
}

#[test]
fn test_no_timeout_keeps_idle_entries() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    add_available(&cache, 1, "one");
    cache.process_lru();

    assert_eq!(cache.check_out(&1).unwrap().as_deref(), Some("one"));
    assert_eq!(Recorder::count(&recorder.timed_out, "one"), 0);
}

// ============================================================================
// PASSIVATION
// ============================================================================

#[test]
fn test_oldest_entry_is_passivated_and_reloaded() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(1, 1, None, &recorder);
    add_available(&cache, 1, "one");
    add_available(&cache, 2, "two");

    assert_eq!(cache.entry_state(&1), None);
    assert_eq!(Recorder::count(&recorder.stored, "one"), 1);

    let value = cache.check_out(&1).unwrap();
    assert_eq!(value.as_deref(), Some("one"));
    assert_eq!(Recorder::count(&recorder.loaded, "one"), 1);
    assert_eq!(cache.entry_state(&1), Some(EntryState::CheckedOut));
    assert_eq!(cache.cache_metrics().activations(), 1);
}

#[test]
fn test_bulk_passivation_takes_oldest_first() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(3, 2, None, &recorder);
    add_available(&cache, 1, "one");
    add_available(&cache, 2, "two");
    add_available(&cache, 3, "three");

    // the third check-in reached capacity and passivated the two oldest
    assert_eq!(cache.entry_state(&1), None);
    assert_eq!(cache.entry_state(&2), None);
    assert_eq!(cache.entry_state(&3), Some(EntryState::Available));
    assert_eq!(cache.cache_metrics().passivations(), 2);
}

#[test]
fn test_checked_out_entries_are_never_passivated() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(1, 5, None, &recorder);
    cache.add(1, "busy".to_string()).unwrap();
    add_available(&cache, 2, "idle");

    assert_eq!(cache.entry_state(&1), Some(EntryState::CheckedOut));
    assert_eq!(Recorder::count(&recorder.stored, "busy"), 0);
    assert_eq!(Recorder::count(&recorder.stored, "idle"), 1);
}

#[test]
fn test_failed_store_keeps_entries_in_memory() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache_with(
        config(1, 1, None),
        FlakyStore {
            inner: memory_store(),
            broken: AtomicBool::new(true),
        },
        &recorder,
    );
    add_available(&cache, 1, "one");

    assert_eq!(Recorder::count(&recorder.stored, "one"), 1);
    assert_eq!(cache.entry_state(&1), Some(EntryState::Available));
    assert_eq!(cache.available(), 1);
    assert_eq!(cache.metrics().get("passivation_failures").copied(), Some(1.0));
    assert_eq!(cache.metrics().get("passivations").copied(), Some(0.0));

    assert_eq!(cache.check_out(&1).unwrap().as_deref(), Some("one"));
    assert_eq!(Recorder::count(&recorder.loaded, "one"), 0);
}

#[test]
fn test_checkout_during_store_reloads_value() {
    let recorder = Arc::new(Recorder::default());
    let gate = Arc::new(Gate::default());
    let store = GatedStore {
        inner: memory_store(),
        gate: Arc::clone(&gate),
    };
    let cache = make_cache_with(config(1, 1, None), store, &recorder);
    cache.add(1, "one".to_string()).unwrap();

    std::thread::scope(|scope| {
        let passivating = scope.spawn(|| cache.check_in(&1));
        while !gate.storing.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let checkout = scope.spawn(|| cache.check_out(&1));
        std::thread::sleep(Duration::from_millis(50));
        gate.release.store(true, Ordering::SeqCst);

        passivating.join().unwrap().unwrap();
        assert_eq!(checkout.join().unwrap().unwrap().as_deref(), Some("one"));
    });

    assert_eq!(Recorder::count(&recorder.loaded, "one"), 1);
    assert_eq!(cache.entry_state(&1), Some(EntryState::CheckedOut));
    assert_eq!(cache.cache_metrics().activations(), 1);
}

#[test]
fn test_vetoed_entry_is_discarded() {
    let recorder = Arc::new(Recorder {
        veto: Some("fragile".to_string()),
        ..Recorder::default()
    });
    let cache = make_cache(1, 1, None, &recorder);
    add_available(&cache, 1, "fragile");

    assert_eq!(cache.entry_state(&1), None);
    assert!(cache.check_out(&1).unwrap().is_none());
    assert_eq!(cache.metrics().get("vetoes").copied(), Some(1.0));
}

#[test]
fn test_refused_activation_fails_checkout() {
    let recorder = Arc::new(Recorder {
        refuse_loads: true,
        ..Recorder::default()
    });
    let cache = make_cache(1, 1, None, &recorder);
    add_available(&cache, 1, "one");

    assert!(matches!(cache.check_out(&1), Err(CacheError::Load { .. })));
    assert_eq!(Recorder::count(&recorder.loaded, "one"), 1);
    // the store handed the value over; it is gone
    assert!(cache.check_out(&1).unwrap().is_none());
}

#[test]
fn test_directory_passivation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let cache = InstanceCache::init(
        config(1, 1, None),
        DirectoryPassivater::new(dir.path(), JsonCodec::<String>::new()),
    );
    cache.set_listener(Arc::clone(&recorder) as Arc<dyn CacheListener<String>>);

    add_available(&cache, 1, "one");
    add_available(&cache, 2, "two");
    assert!(dir.path().join("1").exists());

    assert_eq!(cache.check_out(&1).unwrap().as_deref(), Some("one"));
    assert!(!dir.path().join("1").exists());
    assert_eq!(Recorder::count(&recorder.loaded, "one"), 1);
}

// ============================================================================
// REMOVAL
// ============================================================================

#[test]
fn test_remove_all_by_filter() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    add_available(&cache, 1, "a:1");
    add_available(&cache, 2, "b:2");
    cache.add(3, "a:3".to_string()).unwrap();

    let mut removed = cache.remove_all(|value| value.starts_with("a:"));
    removed.sort();
    assert_eq!(removed, vec!["a:1".to_string(), "a:3".to_string()]);

    assert!(cache.check_out(&1).unwrap().is_none());
    assert!(cache.check_out(&3).unwrap().is_none());
    assert_eq!(cache.check_out(&2).unwrap().as_deref(), Some("b:2"));
}

#[test]
fn test_removed_key_can_be_added_again() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    add_available(&cache, 1, "old");

    assert_eq!(cache.remove(&1).as_deref(), Some("old"));
    cache.add(1, "new".to_string()).unwrap();
    cache.check_in(&1).unwrap();
    assert_eq!(cache.check_out(&1).unwrap().as_deref(), Some("new"));
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_concurrent_checkout_hands_out_one_copy() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(10, 1, None, &recorder);
    add_available(&cache, 1, "one");

    let winners = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);
    let mut pool = scoped_threadpool::Pool::new(4);
    pool.scoped(|scope| {
        for _ in 0..8 {
            scope.execute(|| match cache.check_out(&1) {
                Ok(Some(_)) => {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                Err(CacheError::AlreadyCheckedOut(_)) => {
                    conflicts.fetch_add(1, Ordering::SeqCst);
                }
                other => panic!("unexpected checkout result: {other:?}"),
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(conflicts.load(Ordering::SeqCst), 7);
}

#[test]
fn test_concurrent_check_in_with_passivation() {
    let recorder = Arc::new(Recorder::default());
    let cache = make_cache(8, 4, None, &recorder);

    let mut pool = scoped_threadpool::Pool::new(4);
    pool.scoped(|scope| {
        for thread in 0..4u32 {
            let cache = &cache;
            scope.execute(move || {
                for i in 0..50u32 {
                    let key = thread * 1000 + i;
                    cache.add(key, format!("v{key}")).unwrap();
                    cache.check_in(&key).unwrap();
                    let value = cache.check_out(&key).unwrap();
                    assert_eq!(value, Some(format!("v{key}")));
                    cache.check_in(&key).unwrap();
                }
            });
        }
    });

    // every value is either in memory or passivated, and reloads intact
    for thread in 0..4u32 {
        for i in 0..50u32 {
            let key = thread * 1000 + i;
            assert_eq!(cache.check_out(&key).unwrap(), Some(format!("v{key}")));
        }
    }
    assert_eq!(cache.available(), 0);
    assert_eq!(cache.len(), 200);
}
