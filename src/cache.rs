//! Cache facades and the eviction coordinator.
//!
//! Two facades wrap the storage engine:
//!
//! - [`SearchCache`]: unshared (single-owner) mode. Mutations take `&mut
//!   self`, reads take `&self`, nothing synchronizes.
//! - [`SharedSearchCache`]: shared mode. Every operation takes `&self`;
//!   readers never block, structural mutations serialize on the engine's
//!   internal mutex.
//!
//! Both expire entries with two independent time-based policies:
//! expire-after-write (creation TTL) and expire-after-access (access TTL).
//! The policies are deliberately independent so that an entry which is read
//! constantly is still refreshed once its creation TTL lapses.
//!
//! ## Eviction coordinator
//!
//! Cleanup is amortized across writes. Each `put` stamps the ticker with the
//! current clock reading and then sweeps a bounded prefix of the
//! insertion-order chain, removing entries whose creation or access
//! timestamps fall outside their TTL windows. The sweep processes at most
//! [`REMOVE_DEPTH`] entries and is skipped entirely when fewer than the
//! ticker's cleanup threshold ticks have elapsed since the previous sweep,
//! so read-heavy workloads pay nothing and write-heavy workloads pay O(1)
//! amortized.
//!
//! Reads are kept as thin as possible: a `get` resolves the segment, probes,
//! stamps the entry's access time from the cached tick and returns. No clock
//! read, no cleanup.

use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::compare::Equivalence;
use crate::ds::entry::Entry;
use crate::ds::segment::{Removed, SegmentMap};
use crate::error::InvariantError;
use crate::stats::CacheStatistics;
use crate::ticker::{Clock, SystemClock, Tick, Ticker, CLEANUP_TIME_THRESHOLD};

/// Default initial capacity (reservoir entries preallocated).
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default TTL for the expire-after-access policy, in ticks.
pub const DEFAULT_ACCESS_TTL: Tick = 200;

/// Default TTL for the expire-after-write policy, in ticks.
pub const DEFAULT_CREATE_TTL: Tick = 600;

/// Maximum chain entries examined by one cleanup sweep. The sweep may remove
/// up to `REMOVE_DEPTH + 1` entries (one removal can trail the scan).
pub const REMOVE_DEPTH: usize = 100;

/// Mode-agnostic cache state shared by both facades.
pub(crate) struct CacheCore<K, V> {
    map: SegmentMap<K, V>,
    ticker: Ticker,
    access_ttl: AtomicI64,
    create_ttl: AtomicI64,
    clock: Box<dyn Clock>,
}

impl<K, V> CacheCore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new(
        capacity: usize,
        access_ttl: Tick,
        create_ttl: Tick,
        cleanup_threshold: Tick,
        clock: Box<dyn Clock>,
        shared: bool,
    ) -> Self {
        let ticker = Ticker::with_threshold(clock.now(), cleanup_threshold);
        Self {
            map: SegmentMap::new(capacity, shared),
            ticker,
            access_ttl: AtomicI64::new(access_ttl),
            create_ttl: AtomicI64::new(create_ttl),
            clock,
        }
    }

    /// Resolves `key` and stamps the entry's access time from the cached
    /// tick. The read path never touches the clock or the cleanup machinery.
    fn get_entry(&self, key: &K) -> Option<*mut Entry<K, V>> {
        let entry = self.map.get_entry(key)?;
        // SAFETY: entries live as long as the map; timestamp races between
        // concurrent readers are last-writer-wins by design.
        unsafe { (*entry).set_access_time(self.ticker.next_tick()) };
        Some(entry)
    }

    /// Inserts or overwrites, stamps creation time, then amortizes cleanup.
    fn put(&self, key: K, value: V) {
        let entry = self.map.put_entry(key, value);
        let now = self.clock.now();
        // Cache the timestamp so reads can reuse it without a clock call.
        self.ticker.set_next_tick(now);
        // SAFETY: as in `get_entry`.
        unsafe { (*entry).set_creation_time(now) };
        self.clean_up();
    }

    /// Bounded oldest-first sweep over the insertion-order chain.
    ///
    /// At most one pending removal is buffered while scanning so the engine
    /// never removes the entry the cursor currently stands on.
    fn clean_up(&self) {
        if self.ticker.skip_cleanup() {
            return;
        }

        let next_tick = self.ticker.next_tick();
        let create_threshold = next_tick - self.create_ttl.load(Ordering::Relaxed);
        let access_threshold = next_tick - self.access_ttl.load(Ordering::Relaxed);

        let mut pending: Option<K> = None;
        let mut processed = 0;
        for entry in self.map.iter_entries() {
            if processed >= REMOVE_DEPTH {
                break;
            }
            processed += 1;

            if let Some(key) = pending.take() {
                drop(self.map.remove(&key));
            }

            // SAFETY: the chain walk yields live entries.
            let e = unsafe { &*entry };
            // Either policy may expire the entry. A never-read entry carries
            // the access sentinel (+inf) and can only age out by creation.
            if e.creation_time() <= create_threshold || e.access_time() <= access_threshold {
                pending = e.key().cloned();
            }
        }
        if let Some(key) = pending {
            drop(self.map.remove(&key));
        }
        self.ticker.mark_cleanup();
    }

    fn set_access_ttl(&self, ttl: Tick) {
        self.access_ttl.store(ttl, Ordering::Relaxed);
    }

    fn set_create_ttl(&self, ttl: Tick) {
        self.create_ttl.store(ttl, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// SearchCache (unshared)
// ---------------------------------------------------------------------------

/// Unshared cache: one owner thread, zero synchronization.
///
/// # Example
///
/// ```
/// use searchcache::cache::SearchCache;
///
/// let mut cache = SearchCache::new();
/// cache.put("a", 1);
/// cache.put("b", 2);
/// cache.put("a", 3);
///
/// assert_eq!(cache.size(), 2);
/// assert_eq!(cache.get(&"a"), Some(&3));
/// assert_eq!(cache.get(&"c"), None);
/// ```
pub struct SearchCache<K, V> {
    core: CacheCore<K, V>,
}

// SAFETY: the cache can migrate between threads with its contents; it is
// deliberately not Sync, so all raw-pointer mutation stays single-threaded.
unsafe impl<K: Send, V: Send> Send for SearchCache<K, V> {}

impl<K, V> SearchCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a cache with the default capacity and TTLs.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a cache with the default TTLs and the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            core: CacheCore::new(
                capacity,
                DEFAULT_ACCESS_TTL,
                DEFAULT_CREATE_TTL,
                CLEANUP_TIME_THRESHOLD,
                Box::new(SystemClock),
                false,
            ),
        }
    }

    pub(crate) fn from_core(core: CacheCore<K, V>) -> Self {
        Self { core }
    }

    /// Returns the value for `key` if present, recording an access.
    pub fn get(&self, key: &K) -> Option<&V> {
        let entry = self.core.get_entry(key)?;
        // SAFETY: value boxes outlive any `&self` borrow; overwriting or
        // removing requires `&mut self`.
        unsafe { (*entry).value_ref() }
    }

    /// Returns `true` if `key` is mapped, without recording an access.
    pub fn contains_key(&self, key: &K) -> bool {
        self.core.map.get_entry(key).is_some()
    }

    /// Inserts or overwrites a mapping, then performs amortized cleanup.
    pub fn put(&mut self, key: K, value: V) {
        self.core.put(key, value);
    }

    /// Inserts every pair from `entries`.
    pub fn put_all(&mut self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    /// Removes the mapping for `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self.core.map.remove(key)? {
            Removed::Owned(value) => Some(value),
            Removed::Shared(_) => None,
        }
    }

    /// Removes every mapping and recycles the entry chain.
    pub fn invalidate_all(&mut self) {
        self.core.map.clear();
    }

    /// Number of live mappings.
    pub fn size(&self) -> usize {
        self.core.map.len()
    }

    /// Returns `true` if no mappings are live.
    pub fn is_empty(&self) -> bool {
        self.core.map.is_empty()
    }

    /// Iterates live mappings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.core.map.iter_entries().filter_map(|entry| {
            // SAFETY: live entries with immutable keys; values pinned while
            // `&self` is borrowed.
            let e = unsafe { &*entry };
            match (e.key(), e.value_ref()) {
                (Some(key), Some(value)) => Some((key, value)),
                _ => None,
            }
        })
    }

    /// Runs an eviction sweep now (normally amortized into `put`).
    pub fn clean_up(&mut self) {
        self.core.clean_up();
    }

    /// Replaces the expire-after-access TTL.
    pub fn set_access_ttl(&mut self, ttl: Tick) {
        self.core.set_access_ttl(ttl);
    }

    /// Replaces the expire-after-write TTL.
    pub fn set_create_ttl(&mut self, ttl: Tick) {
        self.core.set_create_ttl(ttl);
    }

    /// Installs a custom key equivalence, leaving the direct fast path.
    /// Only meaningful on an empty cache: hashes of resident keys are not
    /// recomputed.
    pub fn set_key_equivalence(&mut self, equivalence: Box<dyn Equivalence<K>>) {
        self.core.map.set_key_equivalence(equivalence);
    }

    /// Returns the installed key equivalence, if any.
    pub fn key_equivalence(&self) -> Option<&dyn Equivalence<K>> {
        self.core.map.key_equivalence()
    }

    /// Installs a value equivalence. Held for embedders; the lookup path
    /// does not consult it.
    pub fn set_value_equivalence(&mut self, equivalence: Box<dyn Equivalence<V>>) {
        self.core.map.set_value_equivalence(equivalence);
    }

    /// Returns the installed value equivalence, if any.
    pub fn value_equivalence(&self) -> Option<&dyn Equivalence<V>> {
        self.core.map.value_equivalence()
    }

    /// Diagnostic snapshot of the storage engine.
    pub fn statistics(&self) -> CacheStatistics {
        self.core.map.statistics()
    }

    /// Verifies structural invariants. Intended for tests.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        self.core.map.check_invariants()
    }
}

impl<K, V> Default for SearchCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SharedSearchCache
// ---------------------------------------------------------------------------

/// Shared cache: concurrent readers, serialized structural writers.
///
/// Readers never acquire a lock. They snapshot segment state atomically and
/// observe a mapping no older than their last synchronization point; access
/// timestamp updates race last-writer-wins. Writers probe and overwrite
/// lock-free and take the internal mutex only to create or remove mappings.
///
/// Values are returned by clone, since a reader can hold a value while a
/// writer replaces it.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use searchcache::cache::SharedSearchCache;
///
/// let cache = Arc::new(SharedSearchCache::new());
/// cache.put(1u64, "one".to_string());
///
/// let reader = Arc::clone(&cache);
/// let handle = std::thread::spawn(move || reader.get(&1));
/// assert_eq!(handle.join().unwrap(), Some("one".to_string()));
/// ```
pub struct SharedSearchCache<K, V> {
    core: CacheCore<K, V>,
}

// SAFETY: shared mode serializes every structural mutation on the engine's
// internal mutex, publishes tables and segment states with release stores,
// and never frees memory a reader snapshot could still reference (graveyard
// rule). Key and value types must themselves be shareable.
unsafe impl<K: Send, V: Send> Send for SharedSearchCache<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SharedSearchCache<K, V> {}

impl<K, V> SharedSearchCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a shared cache with the default capacity and TTLs.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a shared cache with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            core: CacheCore::new(
                capacity,
                DEFAULT_ACCESS_TTL,
                DEFAULT_CREATE_TTL,
                CLEANUP_TIME_THRESHOLD,
                Box::new(SystemClock),
                true,
            ),
        }
    }

    pub(crate) fn from_core(core: CacheCore<K, V>) -> Self {
        Self { core }
    }

    /// Returns a clone of the value for `key`, recording an access. Never
    /// blocks.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.core.get_entry(key)?;
        // SAFETY: value boxes referenced by any reachable entry stay
        // allocated until the cache drops.
        unsafe { (*entry).value_ref() }.cloned()
    }

    /// Returns `true` if `key` is mapped, without recording an access.
    pub fn contains_key(&self, key: &K) -> bool {
        self.core.map.get_entry(key).is_some()
    }

    /// Inserts or overwrites a mapping, then performs amortized cleanup.
    pub fn put(&self, key: K, value: V) {
        self.core.put(key, value);
    }

    /// Inserts every pair from `entries`.
    pub fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    /// Removes the mapping for `key`, returning a clone of its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        match self.core.map.remove(key)? {
            Removed::Owned(value) => Some(value),
            // SAFETY: shared removals park the value box in the graveyard,
            // so the pointer stays valid until the cache drops.
            Removed::Shared(value) => Some(unsafe { (*value).clone() }),
        }
    }

    /// Removes every mapping. In-flight readers and iterators keep seeing
    /// the detached state they started on.
    pub fn invalidate_all(&self) {
        self.core.map.clear();
    }

    /// Number of live mappings.
    pub fn size(&self) -> usize {
        self.core.map.len()
    }

    /// Returns `true` if no mappings are live.
    pub fn is_empty(&self) -> bool {
        self.core.map.is_empty()
    }

    /// Visits live mappings in insertion order. The traversal is lock-free
    /// and sees a consistent chain no older than its starting point.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for entry in self.core.map.iter_entries() {
            // SAFETY: shared-mode entries and their keys are never recycled.
            let e = unsafe { &*entry };
            if let (Some(key), Some(value)) = (e.key(), e.value_ref()) {
                f(key, value);
            }
        }
    }

    /// Runs an eviction sweep now (normally amortized into `put`).
    pub fn clean_up(&self) {
        self.core.clean_up();
    }

    /// Replaces the expire-after-access TTL.
    pub fn set_access_ttl(&self, ttl: Tick) {
        self.core.set_access_ttl(ttl);
    }

    /// Replaces the expire-after-write TTL.
    pub fn set_create_ttl(&self, ttl: Tick) {
        self.core.set_create_ttl(ttl);
    }

    /// Installs a custom key equivalence before the cache is shared.
    pub fn set_key_equivalence(&mut self, equivalence: Box<dyn Equivalence<K>>) {
        self.core.map.set_key_equivalence(equivalence);
    }

    /// Installs a value equivalence before the cache is shared.
    pub fn set_value_equivalence(&mut self, equivalence: Box<dyn Equivalence<V>>) {
        self.core.map.set_value_equivalence(equivalence);
    }

    /// Diagnostic snapshot of the storage engine.
    pub fn statistics(&self) -> CacheStatistics {
        self.core.map.statistics()
    }

    /// Verifies structural invariants. Intended for tests; call while no
    /// writer is active.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        self.core.map.check_invariants()
    }
}

impl<K, V> Default for SharedSearchCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SearchCacheBuilder;
    use crate::ticker::ManualClock;

    fn manual_cache(
        access_ttl: Tick,
        create_ttl: Tick,
    ) -> (SearchCache<&'static str, u64>, ManualClock) {
        let clock = ManualClock::new(0);
        let cache = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(access_ttl)
            .expire_after_write(create_ttl)
            .clock(clock.clone())
            .build();
        (cache, clock)
    }

    #[test]
    fn basic_put_get_overwrite() {
        let mut cache = SearchCache::new();
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 3);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(&"a"), Some(&3));
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), None);
    }

    #[test]
    fn remove_returns_the_value() {
        let mut cache = SearchCache::new();
        cache.put("a", 1);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_all_inserts_every_pair() {
        let mut cache = SearchCache::new();
        cache.put_all(vec![("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.get(&"b"), Some(&2));
    }

    #[test]
    fn invalidate_all_empties_the_cache() {
        let mut cache = SearchCache::new();
        cache.put_all((0..100u64).map(|k| (k, k)));
        cache.invalidate_all();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get(&5), None);
        cache.put(5, 50);
        assert_eq!(cache.get(&5), Some(&50));
    }

    #[test]
    fn access_expiry_removes_stale_read_entries() {
        let (mut cache, clock) = manual_cache(200, 10_000);
        cache.put("k", 1);
        // Read once at tick 0 so the access clock starts ticking.
        assert_eq!(cache.get(&"k"), Some(&1));

        clock.set(260);
        cache.put("k2", 2);
        // 260 - 200 = 60 >= 0, the access timestamp of "k" has aged out.
        assert_eq!(cache.get(&"k"), None);
        assert_eq!(cache.get(&"k2"), Some(&2));
    }

    #[test]
    fn never_read_entries_are_shielded_from_access_expiry() {
        let (mut cache, clock) = manual_cache(200, 10_000);
        cache.put("k", 1);
        // No reads: the access sentinel keeps the entry alive until the
        // creation TTL would fire.
        clock.set(260);
        cache.put("k2", 2);
        assert!(cache.contains_key(&"k"));
    }

    #[test]
    fn write_expiry_overrides_recent_access() {
        let (mut cache, clock) = manual_cache(200, 300);
        cache.put("k", 1);
        for tick in [100, 200, 300] {
            clock.set(tick);
            // Keep the entry fresh by access; note gets reuse the cached
            // tick, so stamp it through a put-free read path.
            cache.core.ticker.set_next_tick(tick);
            assert_eq!(cache.get(&"k"), Some(&1));
        }
        clock.set(360);
        cache.put("x", 9);
        // Creation TTL fired despite the access at tick 300.
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn cleanup_gate_skips_close_writes() {
        let (mut cache, clock) = manual_cache(10_000, 10);
        cache.put("a", 1);
        // "a" is already past its creation TTL at tick 30, but the gate
        // (threshold 50) suppresses the sweep.
        clock.set(30);
        cache.put("b", 2);
        assert_eq!(cache.size(), 2);
        assert!(cache.contains_key(&"a"));

        // Once the gate opens, both stale entries go.
        clock.set(100);
        cache.put("c", 3);
        assert!(!cache.contains_key(&"a"));
        assert!(!cache.contains_key(&"b"));
        assert!(cache.contains_key(&"c"));
    }

    #[test]
    fn cleanup_is_bounded_per_put() {
        let clock = ManualClock::new(0);
        let mut cache: SearchCache<u64, u64> = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(10_000)
            .expire_after_write(10)
            .clock(clock.clone())
            .build();
        for key in 0..500u64 {
            // Stamp creation manually so every entry is long expired.
            let entry = cache.core.map.put_entry(key, key);
            unsafe { (*entry).set_creation_time(1) };
        }
        assert_eq!(cache.core.map.len(), 500);

        clock.set(1_000);
        cache.put(9_999, 0);
        // One sweep removes at most REMOVE_DEPTH + 1 entries.
        assert!(cache.core.map.len() >= 501 - (REMOVE_DEPTH + 1));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn ttl_setters_take_effect_immediately() {
        let (mut cache, clock) = manual_cache(10_000, 10_000);
        cache.put("a", 1);
        cache.set_create_ttl(10);
        clock.set(100);
        cache.put("b", 2);
        assert!(!cache.contains_key(&"a"));
    }

    #[test]
    fn iteration_is_in_insertion_order() {
        let mut cache = SearchCache::new();
        for (k, v) in [("x", 1), ("y", 2), ("z", 3)] {
            cache.put(k, v);
        }
        cache.put("y", 20);
        let pairs: Vec<(&str, u64)> = cache.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(pairs, vec![("x", 1), ("y", 20), ("z", 3)]);
    }

    #[test]
    fn statistics_reflect_the_store() {
        let mut cache = SearchCache::with_capacity(16);
        for key in 0..10u64 {
            cache.put(key, key);
        }
        let stats = cache.statistics();
        assert_eq!(stats.size, 10);
        assert!(!stats.shared);
        assert!(stats.slots >= 32);
        assert!(stats.entries >= 16);
        let rendered = stats.to_string();
        assert!(rendered.contains("SIZE: 10"));
    }

    #[test]
    fn shared_facade_clones_values() {
        let cache: SharedSearchCache<u64, String> = SharedSearchCache::with_capacity(16);
        cache.put(1, "one".to_string());
        assert_eq!(cache.get(&1), Some("one".to_string()));
        assert_eq!(cache.remove(&1), Some("one".to_string()));
        assert_eq!(cache.get(&1), None);
        assert!(cache.statistics().shared);
    }

    #[test]
    fn shared_for_each_sees_insertion_order() {
        let cache: SharedSearchCache<u64, u64> = SharedSearchCache::with_capacity(16);
        for key in [5u64, 3, 8] {
            cache.put(key, key * 2);
        }
        let mut seen = Vec::new();
        cache.for_each(|k, v| seen.push((*k, *v)));
        assert_eq!(seen, vec![(5, 10), (3, 6), (8, 16)]);
    }
}
