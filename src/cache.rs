//! Instance Cache
//!
//! A keyed cache of live, stateful values with a checkout/checkin protocol. A
//! value is either *checked out* to exactly one caller, *available* in memory and
//! queued by recency, or *passivated* into a [`PassivationStrategy`]. Available
//! values that sit idle past the configured timeout are discarded.
//!
//! # How It Works
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                             InstanceCache                              │
//! │                                                                        │
//! │  index: Mutex<HashMap<K, Arc<Mutex<Entry>>>>                           │
//! │     │                                                                  │
//! │     ├──▶ Entry { value, state, last_access }  (own lock per entry)     │
//! │     │                                                                  │
//! │  lru: Mutex<LruQueue<K>>   available keys only, oldest first           │
//! │                                                                        │
//! │  check_in ──▶ process_lru ──▶ 1. discard timed-out entries at the head │
//! │                              2. if available ≥ capacity, passivate     │
//! │                                 up to bulk_passivate oldest entries    │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Entry locks are taken first; the index and LRU mutexes are leaves held only
//! for a map operation and never while blocking on an entry lock. The LRU pass
//! takes entry locks with `try_lock`, so it never waits on a caller that holds an
//! entry. A candidate it cannot lock goes back to the head of the queue for the
//! next pass.
//!
//! Entries being passivated stay locked until the store returns. A checkout that
//! races with the store blocks on the entry lock, sees it passivated and retries
//! through the store.
//!
//! Activation is serialized per key by a loading gate, so two callers that both
//! miss the index never read the same value back twice. The gate covers the
//! store read and the index insert only; `after_load` runs after it is released.
//!
//! ## Listener
//!
//! A [`CacheListener`] observes the lifecycle. Its callbacks run without any
//! cache-level lock held, apart from the locks on the entries being passivated
//! in `before_store`. Callbacks may therefore use the cache again, as long as
//! they do not touch an entry of the batch being passivated.
//!
//! # Example
//!
//! ```rust
//! use stateful_rs::cache::{EntryState, InstanceCache};
//! use stateful_rs::config::InstanceCacheConfig;
//! use stateful_rs::passivation::{JsonCodec, MemoryPassivater};
//! use core::num::NonZeroUsize;
//!
//! let config = InstanceCacheConfig {
//!     capacity: NonZeroUsize::new(2).unwrap(),
//!     bulk_passivate: 1,
//!     timeout: None,
//! };
//! let cache = InstanceCache::init(config, MemoryPassivater::new(JsonCodec::<String>::new()));
//!
//! cache.add(1u32, "first".to_string()).unwrap();
//! cache.check_in(&1).unwrap();
//! assert_eq!(cache.entry_state(&1), Some(EntryState::Available));
//!
//! let value = cache.check_out(&1).unwrap();
//! assert_eq!(value.as_deref(), Some("first"));
//! assert!(cache.check_out(&1).is_err());
//! ```

use crate::config::InstanceCacheConfig;
use crate::entry::{Entry, EntryRef};
use crate::error::{BoxError, CacheError};
use crate::metrics::{InstanceCacheMetrics, Manageable};
use crate::passivation::PassivationStrategy;
use crate::queue::LruQueue;
use crate::HashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub use crate::entry::EntryState;

/// How many times `check_out` retries an entry that was passivated while it
/// waited for the entry lock.
const MAX_CHECKOUT_ATTEMPTS: usize = 10;

/// Lifecycle observer for cached values.
///
/// Errors from `after_load` refuse the loaded value and fail the checkout.
/// Errors from `before_store` veto passivation of that value, which is then
/// discarded. Errors from `timed_out` are logged and ignored.
pub trait CacheListener<V>: Send + Sync {
    /// Called after a value was activated from the store, before it is handed out.
    fn after_load(&self, value: &V) -> Result<(), BoxError>;

    /// Called before a value is handed to the passivation store.
    fn before_store(&self, value: &V) -> Result<(), BoxError>;

    /// Called after an idle value was discarded.
    fn timed_out(&self, value: &V) -> Result<(), BoxError>;
}

/// Outcome of activating a key that was not in the index.
enum Loaded<K, V> {
    Value(EntryRef<K, V>, V),
    Missing,
    Raced,
}

/// Per-key lock held while a value is read back from the store.
type LoadingGate = Arc<Mutex<()>>;

/// Keyed cache with a checkout protocol, LRU passivation and idle timeouts.
///
/// # Type Parameters
///
/// - `K`: Key type. Must implement `Hash + Eq + Clone + Debug`.
/// - `V`: Value type. Cloned when handed out, so it is usually an `Arc`.
pub struct InstanceCache<K, V> {
    config: InstanceCacheConfig,
    index: Mutex<HashMap<K, EntryRef<K, V>>>,
    lru: Mutex<LruQueue<K>>,
    loading: Mutex<HashMap<K, LoadingGate>>,
    listener: RwLock<Option<Arc<dyn CacheListener<V>>>>,
    passivator: Box<dyn PassivationStrategy<K, V>>,
    metrics: InstanceCacheMetrics,
}

impl<K, V> InstanceCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    /// Creates an empty cache that passivates into `passivator`.
    pub fn init<P>(config: InstanceCacheConfig, passivator: P) -> Self
    where
        P: PassivationStrategy<K, V> + 'static,
    {
        Self::init_boxed(config, Box::new(passivator))
    }

    /// Creates an empty cache from an already boxed passivation strategy.
    pub fn init_boxed(
        config: InstanceCacheConfig,
        passivator: Box<dyn PassivationStrategy<K, V>>,
    ) -> Self {
        Self {
            config,
            index: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruQueue::new()),
            loading: Mutex::new(HashMap::new()),
            listener: RwLock::new(None),
            passivator,
            metrics: InstanceCacheMetrics::new(),
        }
    }

    /// Installs the lifecycle listener, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn CacheListener<V>>) {
        *self.listener.write() = Some(listener);
    }

    /// The currently installed listener.
    pub fn listener(&self) -> Option<Arc<dyn CacheListener<V>>> {
        self.listener.read().clone()
    }

    /// Cache configuration.
    pub fn config(&self) -> &InstanceCacheConfig {
        &self.config
    }

    /// Cache counters.
    pub fn cache_metrics(&self) -> &InstanceCacheMetrics {
        &self.metrics
    }

    /// Number of entries held in memory, checked out or available.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    /// `true` if no entry is held in memory.
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Number of available entries waiting in the LRU queue.
    pub fn available(&self) -> usize {
        self.lru.lock().len()
    }

    /// State of the in-memory entry for `key`, if any. Passivated values are not
    /// in memory and report `None`.
    pub fn entry_state(&self, key: &K) -> Option<EntryState> {
        let entry = self.lookup(key)?;
        let state = entry.lock().state();
        Some(state)
    }

    /// Adds a new value in the checked-out state.
    ///
    /// Fails with [`CacheError::AlreadyExists`] if a live entry holds the key. A
    /// removed entry still left in the index is replaced.
    pub fn add(&self, key: K, value: V) -> Result<(), CacheError> {
        let entry = Entry::checked_out(key.clone(), value).into_ref();
        // not reachable by other threads until indexed
        let _guard = entry.lock();
        loop {
            let existing = {
                let mut index = self.index.lock();
                match index.get(&key).cloned() {
                    Some(existing) => existing,
                    None => {
                        index.insert(key, Arc::clone(&entry));
                        self.metrics.record_add();
                        return Ok(());
                    }
                }
            };

            let existing_guard = existing.lock();
            if existing_guard.state() != EntryState::Removed {
                return Err(CacheError::AlreadyExists(format!("{key:?}")));
            }
            let mut index = self.index.lock();
            if index.get(&key).is_some_and(|current| Arc::ptr_eq(current, &existing)) {
                index.insert(key, Arc::clone(&entry));
                self.metrics.record_add();
                return Ok(());
            }
        }
    }

    /// Checks a value out for exclusive use.
    ///
    /// Returns `Ok(None)` if the key is unknown both in memory and in the
    /// passivation store. A passivated value is activated, passed to the
    /// listener's `after_load` and handed out checked out. Concurrent checkouts
    /// of the same passivated key activate it once; the others see it checked
    /// out.
    pub fn check_out(&self, key: &K) -> Result<Option<V>, CacheError> {
        for _ in 0..MAX_CHECKOUT_ATTEMPTS {
            let Some(entry) = self.lookup(key) else {
                match self.load(key)? {
                    Loaded::Value(_, value) => return Ok(Some(value)),
                    Loaded::Missing => return Ok(None),
                    Loaded::Raced => continue,
                }
            };

            let mut guard = entry.lock();
            match guard.state() {
                EntryState::Available => return Ok(Some(self.take(key, &mut guard))),
                EntryState::CheckedOut => {
                    return Err(CacheError::AlreadyCheckedOut(format!("{key:?}")));
                }
                EntryState::Passivated => {
                    // stored while we waited; drop the stale handle and go through the store
                    self.unindex(key, &entry);
                }
                EntryState::Removed => return Ok(None),
            }
        }

        if let Some(entry) = self.lookup(key) {
            let mut guard = entry.lock();
            self.unindex(key, &entry);
            self.lru.lock().remove(key);
            if guard.state() != EntryState::Removed {
                guard.set_state(EntryState::Removed);
            }
        }
        error!(key = ?key, "entry repeatedly observed as passivated; cache index is corrupted");
        Err(CacheError::Corrupted(format!("{key:?}")))
    }

    /// Checks out a value that is resident in memory, without waiting on its
    /// entry and without reading the passivation store.
    ///
    /// Returns `Ok(None)` if the key is not resident or its entry is busy, for
    /// example while it is being passivated. [`check_out`](Self::check_out)
    /// resolves both cases.
    pub fn try_check_out(&self, key: &K) -> Result<Option<V>, CacheError> {
        let Some(entry) = self.lookup(key) else {
            return Ok(None);
        };
        let Some(mut guard) = entry.try_lock() else {
            return Ok(None);
        };
        match guard.state() {
            EntryState::Available => Ok(Some(self.take(key, &mut guard))),
            EntryState::CheckedOut => Err(CacheError::AlreadyCheckedOut(format!("{key:?}"))),
            EntryState::Passivated | EntryState::Removed => Ok(None),
        }
    }

    /// Returns a checked-out value to the cache and runs the LRU pass.
    ///
    /// Unknown and removed keys are ignored. Checking in an entry that is
    /// available only refreshes its idle clock.
    pub fn check_in(&self, key: &K) -> Result<(), CacheError> {
        if self.release(key)? {
            self.process_lru();
        }
        Ok(())
    }

    /// Returns a checked-out value to the LRU queue without running the LRU
    /// pass.
    ///
    /// Returns `true` if the entry became available; the caller then owes a
    /// [`process_lru`](Self::process_lru). Unknown, removed and refreshed
    /// entries return `false`.
    pub fn release(&self, key: &K) -> Result<bool, CacheError> {
        let Some(entry) = self.lookup(key) else {
            return Ok(false);
        };
        let mut guard = entry.lock();
        match guard.state() {
            EntryState::CheckedOut => {
                guard.set_state(EntryState::Available);
                guard.touch();
                self.lru.lock().push_back(key.clone());
                self.metrics.record_checkin();
                Ok(true)
            }
            EntryState::Available => {
                let mut lru = self.lru.lock();
                if !lru.contains(key) {
                    return Err(CacheError::NotCheckedOut(format!("{key:?}")));
                }
                guard.touch();
                lru.push_back(key.clone());
                Ok(false)
            }
            EntryState::Passivated => Err(CacheError::NotCheckedOut(format!("{key:?}"))),
            EntryState::Removed => Ok(false),
        }
    }

    /// Removes the in-memory entry for `key` regardless of its state and returns
    /// its value. Nothing is read from the passivation store.
    pub fn remove(&self, key: &K) -> Option<V> {
        let entry = self.lookup(key)?;
        let mut guard = entry.lock();
        self.unindex(key, &entry);
        self.lru.lock().remove(key);
        match guard.state() {
            EntryState::Removed | EntryState::Passivated => None,
            EntryState::Available | EntryState::CheckedOut => {
                guard.set_state(EntryState::Removed);
                self.metrics.record_removal();
                Some(guard.value().clone())
            }
        }
    }

    /// Removes every in-memory entry whose value matches `filter` and returns the
    /// removed values. Used when a deployment is undeployed.
    pub fn remove_all<F>(&self, filter: F) -> Vec<V>
    where
        F: Fn(&V) -> bool,
    {
        let entries: Vec<(K, EntryRef<K, V>)> = self
            .index
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let mut removed = Vec::new();
        for (key, entry) in entries {
            let mut guard = entry.lock();
            let live = matches!(
                guard.state(),
                EntryState::Available | EntryState::CheckedOut
            );
            if !live || !filter(guard.value()) {
                continue;
            }
            self.unindex(&key, &entry);
            self.lru.lock().remove(&key);
            guard.set_state(EntryState::Removed);
            self.metrics.record_removal();
            removed.push(guard.value().clone());
        }
        removed
    }

    /// Runs the LRU pass: discards timed-out entries at the head of the queue,
    /// then passivates the oldest entries if the queue is at capacity.
    pub fn process_lru(&self) {
        self.discard_timed_out();
        self.passivate_overflow();
    }

    fn lookup(&self, key: &K) -> Option<EntryRef<K, V>> {
        self.index.lock().get(key).cloned()
    }

    /// Drops `key` from the index if it still maps to `entry`.
    fn unindex(&self, key: &K, entry: &EntryRef<K, V>) {
        let mut index = self.index.lock();
        if index.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            index.remove(key);
        }
    }

    /// Hands out an available entry. The caller holds its lock.
    fn take(&self, key: &K, guard: &mut MutexGuard<'_, Entry<K, V>>) -> V {
        self.lru.lock().remove(key);
        guard.set_state(EntryState::CheckedOut);
        self.metrics.record_checkout();
        guard.value().clone()
    }

    fn load(&self, key: &K) -> Result<Loaded<K, V>, CacheError> {
        let gate = self.loading_gate(key);
        let restored = {
            let _loading = gate.lock();
            self.restore(key)
        };
        self.close_loading_gate(key, gate);

        let (entry, value) = match restored? {
            Loaded::Value(entry, value) => (entry, value),
            other => return Ok(other),
        };
        if let Some(listener) = self.listener() {
            if let Err(source) = listener.after_load(&value) {
                let mut guard = entry.lock();
                self.unindex(key, &entry);
                guard.set_state(EntryState::Removed);
                self.metrics.record_load_failure();
                return Err(CacheError::Load {
                    key: format!("{key:?}"),
                    source,
                });
            }
        }
        self.metrics.record_activation();
        Ok(Loaded::Value(entry, value))
    }

    /// Reads `key` back from the store and indexes it checked out. Runs under
    /// the key's loading gate.
    fn restore(&self, key: &K) -> Result<Loaded<K, V>, CacheError> {
        if self.lookup(key).is_some() {
            // activated by the caller that held the gate before us
            return Ok(Loaded::Raced);
        }
        let Some(value) = self.passivator.activate(key)? else {
            self.metrics.record_miss();
            return Ok(Loaded::Missing);
        };

        let entry = Entry::checked_out(key.clone(), value.clone()).into_ref();
        let mut index = self.index.lock();
        if index.contains_key(key) {
            debug!(key = ?key, "activated entry raced with a concurrent add");
            return Ok(Loaded::Raced);
        }
        index.insert(key.clone(), Arc::clone(&entry));
        Ok(Loaded::Value(entry, value))
    }

    fn loading_gate(&self, key: &K) -> LoadingGate {
        Arc::clone(self.loading.lock().entry(key.clone()).or_default())
    }

    /// Drops our handle on the gate, and the gate itself once nobody else waits on it.
    fn close_loading_gate(&self, key: &K, gate: LoadingGate) {
        let mut loading = self.loading.lock();
        if Arc::strong_count(&gate) == 2 {
            loading.remove(key);
        }
        drop(gate);
    }

    fn discard_timed_out(&self) {
        if self.config.timeout.is_none() {
            return;
        }
        loop {
            let Some(key) = self.lru.lock().front().cloned() else {
                return;
            };
            let Some(entry) = self.lookup(&key) else {
                self.lru.lock().remove(&key);
                continue;
            };

            let mut guard = entry.lock();
            if guard.state() != EntryState::Available {
                self.lru.lock().remove(&key);
                continue;
            }
            if !guard.is_timed_out(self.config.timeout) {
                return;
            }
            self.lru.lock().remove(&key);
            self.unindex(&key, &entry);
            guard.set_state(EntryState::Removed);
            let value = guard.value().clone();
            drop(guard);

            self.metrics.record_timeout();
            self.notify_timed_out(&key, &value);
        }
    }

    fn passivate_overflow(&self) {
        let keys: Vec<K> = {
            let mut lru = self.lru.lock();
            if lru.len() < self.config.capacity.get() {
                return;
            }
            (0..self.config.effective_bulk_passivate())
                .map_while(|_| lru.pop_front())
                .collect()
        };

        let candidates: Vec<(K, EntryRef<K, V>)> = keys
            .into_iter()
            .filter_map(|key| self.lookup(&key).map(|entry| (key, entry)))
            .collect();

        let mut locked: Vec<(&K, &EntryRef<K, V>, MutexGuard<'_, Entry<K, V>>)> = Vec::new();
        let mut busy: Vec<K> = Vec::new();
        for (key, entry) in &candidates {
            match entry.try_lock() {
                Some(guard) => locked.push((key, entry, guard)),
                None => busy.push(key.clone()),
            }
        }
        if !busy.is_empty() {
            let mut lru = self.lru.lock();
            for key in busy.into_iter().rev() {
                lru.push_front(key);
            }
        }

        let listener = self.listener();
        let mut timed_out = Vec::new();
        let mut storing = Vec::new();
        let mut batch = Vec::new();
        for (key, entry, mut guard) in locked {
            if guard.state() != EntryState::Available {
                continue;
            }
            if guard.is_timed_out(self.config.timeout) {
                self.unindex(key, entry);
                guard.set_state(EntryState::Removed);
                timed_out.push((key.clone(), guard.value().clone()));
                continue;
            }
            if let Some(listener) = &listener {
                if let Err(err) = listener.before_store(guard.value()) {
                    warn!(key = ?key, error = %err, "passivation vetoed; discarding entry");
                    self.unindex(key, entry);
                    guard.set_state(EntryState::Removed);
                    self.metrics.record_veto();
                    continue;
                }
            }
            guard.set_state(EntryState::Passivated);
            batch.push((key.clone(), guard.value().clone()));
            storing.push((key, entry, guard));
        }

        if !batch.is_empty() {
            let count = batch.len();
            match self.passivator.passivate(batch) {
                Ok(()) => {
                    for (key, entry, _) in &storing {
                        self.unindex(key, entry);
                    }
                    self.metrics.record_passivations(count);
                    debug!(count, "passivated idle entries");
                }
                Err(err) => {
                    error!(count, error = %err, "passivation failed; keeping entries in memory");
                    self.metrics.record_passivation_failure();
                    let mut lru = self.lru.lock();
                    for (key, _, guard) in storing.iter_mut().rev() {
                        guard.set_state(EntryState::Available);
                        lru.push_front((*key).clone());
                    }
                }
            }
        }
        drop(storing);

        for (key, value) in timed_out {
            self.metrics.record_timeout();
            self.notify_timed_out(&key, &value);
        }
    }

    fn notify_timed_out(&self, key: &K, value: &V) {
        debug!(key = ?key, "entry timed out");
        if let Some(listener) = self.listener() {
            if let Err(err) = listener.timed_out(value) {
                warn!(key = ?key, error = %err, "timeout listener failed");
            }
        }
    }
}

impl<K, V> Manageable for InstanceCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.metrics.to_btreemap();
        metrics.insert("in_memory".to_string(), self.len() as f64);
        metrics.insert("available".to_string(), self.available() as f64);
        metrics.insert("capacity".to_string(), self.config.capacity.get() as f64);
        metrics
    }

    fn component_name(&self) -> &'static str {
        "InstanceCache"
    }
}

impl<K: fmt::Debug, V> fmt::Debug for InstanceCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCache")
            .field("config", &self.config)
            .field("in_memory", &self.index.lock().len())
            .field("lru", &*self.lru.lock())
            .finish_non_exhaustive()
    }
}
