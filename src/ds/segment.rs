//! Segmented open-addressed hash table with smooth growth and lock-free
//! reads.
//!
//! ## Architecture
//!
//! ```text
//!   SegmentMap
//!   ├── root: Segment ──► state: Leaf | Inner
//!   │                       │        └── 64 child Segments (recursive)
//!   │                       └── slots: [null | TOMBSTONE | *Entry]
//!   ├── chain: EntryChain   (insertion order + reservoir, see entry.rs)
//!   └── graveyard           (retired tables/entries/values, shared mode)
//! ```
//!
//! A segment is either a leaf (power-of-two slot table, linear probing) or an
//! inner node fanning out to [`C2`] children selected by the next [`B2`] hash
//! bits. Leaves double up to [`C1`] slots; past the ceiling they split into
//! children. A split that detects a pathologically skewed hash distribution
//! falls back to an oversized leaf and logs a warning.
//!
//! ## Reader protocol
//!
//! The per-segment state sits behind an atomic pointer. A reader loads it
//! once (acquire) and probes that snapshot; a writer publishes a resized
//! table or a completed child array with a single release store. A reader
//! therefore always sees either the old complete table or the new complete
//! one, never a half-built structure. Replaced states are freed immediately
//! in unshared mode and parked in the graveyard in shared mode so snapshots
//! outlive their readers.
//!
//! ## Writer protocol
//!
//! Structural mutations (new mapping, removal, clear) are single-writer:
//! the owner in unshared mode, or whoever holds the structural mutex in
//! shared mode. Probes and value overwrites never take the mutex; a put that
//! discovers it needs a new mapping re-enters itself under the mutex, the
//! same way a removal re-enters once it has found its victim.

use std::hash::Hash;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::compare::{fx_hash32, Equivalence};
use crate::ds::entry::{Entry, EntryChain};
use crate::error::InvariantError;
use crate::stats::CacheStatistics;

/// Initial leaf capacity in bits.
pub(crate) const B0: u32 = 4;
/// Initial leaf table length (16).
pub(crate) const C0: usize = 1 << B0;
/// Leaf resize ceiling in bits.
pub(crate) const B1: u32 = 10;
/// Leaf resize ceiling: a leaf doubles up to this length (1024).
pub(crate) const C1: usize = 1 << B1;
/// Hash bits consumed per split level.
pub(crate) const B2: u32 = B1 - B0;
/// Fan-out per split (64).
pub(crate) const C2: usize = 1 << B2;

/// Leaf table: open-addressed slots plus occupancy counters.
///
/// A slot is empty (null), a tombstone (the map-wide marker entry), or a
/// pointer to a live entry. `key_shift` is the number of low hash bits
/// already consumed by ancestors when routing to this leaf.
pub(crate) struct Leaf<K, V> {
    key_shift: u32,
    slots: Box<[AtomicPtr<Entry<K, V>>]>,
    entry_count: AtomicUsize,
    tombstone_count: AtomicUsize,
}

impl<K, V> Leaf<K, V> {
    fn new(len: usize, key_shift: u32) -> Self {
        let slots = (0..len)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            key_shift,
            slots,
            entry_count: AtomicUsize::new(0),
            tombstone_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Probe start for `key_hash`: the logical start is the shifted hash,
    /// masked at access time.
    #[inline]
    fn probe_start(&self, key_hash: i32) -> usize {
        key_hash.wrapping_shr(self.key_shift) as u32 as usize
    }

    /// Inserts an entry during a rebuild (resize, compaction or split). The
    /// target table is not yet published, so plain probing for the first
    /// empty slot suffices.
    fn rebuild_insert(&self, entry: *mut Entry<K, V>) {
        let mask = self.mask();
        // SAFETY: rebuild sources only live entries.
        let start = self.probe_start(unsafe { (*entry).key_hash() });
        let mut step = 0;
        loop {
            let slot = &self.slots[(start + step) & mask];
            if slot.load(Ordering::Relaxed).is_null() {
                slot.store(entry, Ordering::Relaxed);
                break;
            }
            step += 1;
        }
        self.entry_count.fetch_add(1, Ordering::Relaxed);
    }

    fn occupancy(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed) + self.tombstone_count.load(Ordering::Relaxed)
    }
}

/// A segment is a leaf or a fan-out of child segments.
pub(crate) enum SegmentState<K, V> {
    Leaf(Leaf<K, V>),
    Inner {
        key_shift: u32,
        children: Box<[Segment<K, V>]>,
    },
}

/// Tree node owning its current state through an atomic pointer, so state
/// transitions (resize, split, clear) publish with one release store.
pub(crate) struct Segment<K, V> {
    state: AtomicPtr<SegmentState<K, V>>,
}

impl<K, V> Segment<K, V> {
    fn new_leaf(len: usize, key_shift: u32) -> Self {
        Self::from_state(SegmentState::Leaf(Leaf::new(len, key_shift)))
    }

    fn from_state(state: SegmentState<K, V>) -> Self {
        Self {
            state: AtomicPtr::new(Box::into_raw(Box::new(state))),
        }
    }

    #[inline]
    fn state(&self) -> &SegmentState<K, V> {
        // SAFETY: the state pointer is never null, and replaced states stay
        // allocated for as long as any reader can hold a snapshot (graveyard
        // rule in shared mode, exclusivity in unshared mode).
        unsafe { &*self.state.load(Ordering::Acquire) }
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Relaxed);
        if !state.is_null() {
            // SAFETY: dropping a segment exclusively owns its current state;
            // retired states are owned by the graveyard instead.
            unsafe { drop(Box::from_raw(state)) };
        }
    }
}

/// Value returned by a removal.
///
/// Unshared removals own the value outright; shared removals can only lend a
/// pointer, because lock-free readers may still be holding the same box. The
/// pointer stays valid until the map is dropped.
pub(crate) enum Removed<V> {
    Owned(V),
    Shared(*const V),
}

/// Deferred reclamation for shared mode: anything a lock-free reader might
/// still reference is parked here and freed when the map drops.
struct Graveyard<K, V> {
    states: Vec<*mut SegmentState<K, V>>,
    entries: Vec<*mut Entry<K, V>>,
    values: Vec<*mut V>,
}

impl<K, V> Graveyard<K, V> {
    fn new() -> Self {
        Self {
            states: Vec::new(),
            entries: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<K, V> Drop for Graveyard<K, V> {
    fn drop(&mut self) {
        // SAFETY: all parked pointers came from Box::into_raw and the map
        // being dropped means no reader can hold them anymore.
        unsafe {
            for &state in &self.states {
                drop(Box::from_raw(state));
            }
            for &entry in &self.entries {
                drop(Box::from_raw(entry));
            }
            for &value in &self.values {
                drop(Box::from_raw(value));
            }
        }
    }
}

/// The storage/index engine: segment tree + insertion-order chain.
///
/// All operations take `&self`; the facades enforce the writer discipline
/// (exclusive receiver in unshared mode, structural mutex in shared mode).
pub(crate) struct SegmentMap<K, V> {
    root: Segment<K, V>,
    chain: EntryChain<K, V>,
    tombstone: *mut Entry<K, V>,
    key_equivalence: Option<Box<dyn Equivalence<K>>>,
    value_equivalence: Option<Box<dyn Equivalence<V>>>,
    shared: bool,
    initial_table_len: usize,
    structure_lock: Mutex<()>,
    graveyard: Mutex<Graveyard<K, V>>,
}

impl<K, V> SegmentMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates a map sized for `capacity` live entries.
    pub(crate) fn new(capacity: usize, shared: bool) -> Self {
        let mut table_len = C0;
        while table_len < capacity {
            table_len <<= 1;
        }
        // Headroom for the 1/2 load factor.
        table_len <<= 1;

        Self {
            root: Segment::new_leaf(table_len, 0),
            chain: EntryChain::new(capacity),
            tombstone: Box::into_raw(Entry::new_boxed()),
            key_equivalence: None,
            value_equivalence: None,
            shared,
            initial_table_len: table_len,
            structure_lock: Mutex::new(()),
            graveyard: Mutex::new(Graveyard::new()),
        }
    }

    /// Replaces the key equivalence, leaving direct mode.
    pub(crate) fn set_key_equivalence(&mut self, equivalence: Box<dyn Equivalence<K>>) {
        self.key_equivalence = Some(equivalence);
    }

    pub(crate) fn key_equivalence(&self) -> Option<&dyn Equivalence<K>> {
        self.key_equivalence.as_deref()
    }

    /// Replaces the value equivalence. Not consulted by the lookup path.
    pub(crate) fn set_value_equivalence(&mut self, equivalence: Box<dyn Equivalence<V>>) {
        self.value_equivalence = Some(equivalence);
    }

    pub(crate) fn value_equivalence(&self) -> Option<&dyn Equivalence<V>> {
        self.value_equivalence.as_deref()
    }

    #[inline]
    fn hash_key(&self, key: &K) -> i32 {
        match &self.key_equivalence {
            None => fx_hash32(key),
            Some(equivalence) => equivalence.hash_of(key),
        }
    }

    #[inline]
    fn keys_equal(&self, a: &K, b: &K) -> bool {
        match &self.key_equivalence {
            None => a == b,
            Some(equivalence) => equivalence.are_equal(a, b),
        }
    }

    /// Descends from the root to the leaf responsible for `key_hash`,
    /// snapshotting each segment state exactly once.
    fn locate(&self, key_hash: i32) -> (&Segment<K, V>, &Leaf<K, V>) {
        let mut segment = &self.root;
        loop {
            match segment.state() {
                SegmentState::Leaf(leaf) => return (segment, leaf),
                SegmentState::Inner {
                    key_shift,
                    children,
                } => {
                    let index = (key_hash.wrapping_shr(*key_shift) as usize) & (C2 - 1);
                    segment = &children[index];
                }
            }
        }
    }

    /// Looks up the entry for `key`. Never blocks, never touches timestamps.
    pub(crate) fn get_entry(&self, key: &K) -> Option<*mut Entry<K, V>> {
        let key_hash = self.hash_key(key);
        let (_, leaf) = self.locate(key_hash);
        let mask = leaf.mask();
        let start = leaf.probe_start(key_hash);
        let mut step = 0;
        loop {
            let entry = leaf.slots[(start + step) & mask].load(Ordering::Acquire);
            if entry.is_null() {
                return None;
            }
            if entry != self.tombstone {
                // SAFETY: published non-tombstone slots hold initialized
                // entries that live as long as the map.
                let e = unsafe { &*entry };
                if e.key_hash() == key_hash {
                    if let Some(entry_key) = e.key() {
                        if self.keys_equal(key, entry_key) {
                            return Some(entry);
                        }
                    }
                }
            }
            step += 1;
        }
    }

    /// Inserts or overwrites a mapping and returns its entry.
    pub(crate) fn put_entry(&self, key: K, value: V) -> *mut Entry<K, V> {
        let key_hash = self.hash_key(&key);
        let value = Box::into_raw(Box::new(value));
        self.put_hashed(key, value, key_hash, self.shared)
    }

    fn put_hashed(
        &self,
        key: K,
        value: *mut V,
        key_hash: i32,
        concurrent: bool,
    ) -> *mut Entry<K, V> {
        let (segment, leaf) = self.locate(key_hash);
        let mask = leaf.mask();
        let start = leaf.probe_start(key_hash);
        let mut free_slot = None;
        let insert_at;
        let mut step = 0;
        // The 1/2 load factor guarantees an empty slot, so the probe
        // terminates.
        loop {
            let index = (start + step) & mask;
            let entry = leaf.slots[index].load(Ordering::Acquire);
            if entry.is_null() {
                insert_at = free_slot.unwrap_or(index);
                break;
            } else if entry == self.tombstone {
                if free_slot.is_none() {
                    free_slot = Some(index);
                }
            } else {
                // SAFETY: as in `get_entry`.
                let e = unsafe { &*entry };
                if e.key_hash() == key_hash
                    && e.key().is_some_and(|entry_key| self.keys_equal(&key, entry_key))
                {
                    // Overwrite in place; no structural change, so no mutex.
                    let old = e.replace_value(value);
                    self.retire_value(old);
                    return entry;
                }
            }
            step += 1;
        }

        // A new mapping changes structure; serialize and re-run against
        // fresh state.
        if concurrent {
            let _guard = self.structure_lock.lock();
            return self.put_hashed(key, value, key_hash, false);
        }

        let entry = self.chain.reserve();
        // SAFETY: `reserve` hands the writer the unpublished reservoir entry.
        unsafe {
            let e = &*entry;
            e.set_key(Some(key));
            e.set_key_hash(key_hash);
            e.replace_value(value);
        }
        leaf.slots[insert_at].store(entry, Ordering::Release);
        // The slot store above must be visible before the count update is.
        leaf.entry_count.fetch_add(1, Ordering::AcqRel);
        self.chain.advance_tail();

        if leaf.occupancy() > leaf.slots.len() >> 1 {
            self.rebalance(segment, leaf);
        }
        entry
    }

    /// Removes the mapping for `key` if present.
    pub(crate) fn remove(&self, key: &K) -> Option<Removed<V>> {
        let key_hash = self.hash_key(key);
        self.remove_hashed(key, key_hash, self.shared)
    }

    fn remove_hashed(&self, key: &K, key_hash: i32, concurrent: bool) -> Option<Removed<V>> {
        let (_, leaf) = self.locate(key_hash);
        let mask = leaf.mask();
        let start = leaf.probe_start(key_hash);
        let mut step = 0;
        loop {
            let index = (start + step) & mask;
            let entry = leaf.slots[index].load(Ordering::Acquire);
            if entry.is_null() {
                return None;
            }
            if entry != self.tombstone {
                // SAFETY: as in `get_entry`.
                let e = unsafe { &*entry };
                if e.key_hash() == key_hash
                    && e.key().is_some_and(|entry_key| self.keys_equal(key, entry_key))
                {
                    if concurrent {
                        let _guard = self.structure_lock.lock();
                        return self.remove_hashed(key, key_hash, false);
                    }

                    self.chain.unlink(entry);
                    leaf.slots[index].store(self.tombstone, Ordering::Release);
                    leaf.tombstone_count.fetch_add(1, Ordering::Relaxed);
                    leaf.entry_count.fetch_sub(1, Ordering::AcqRel);

                    if self.shared {
                        // Readers may still traverse the entry: abandon it to
                        // the graveyard, value box included.
                        let value = e.value_ref().map(|v| v as *const V);
                        self.graveyard.lock().entries.push(entry);
                        return value.map(Removed::Shared);
                    }
                    let value = e.take_value();
                    self.chain.recycle(entry);
                    return value.map(Removed::Owned);
                }
            }
            step += 1;
        }
    }

    /// Number of live mappings: the sum of leaf entry counts.
    pub(crate) fn len(&self) -> usize {
        fn count<K, V>(segment: &Segment<K, V>) -> usize {
            match segment.state() {
                SegmentState::Leaf(leaf) => leaf.entry_count.load(Ordering::Acquire),
                SegmentState::Inner { children, .. } => children.iter().map(count).sum(),
            }
        }
        count(&self.root)
    }

    pub(crate) fn is_empty(&self) -> bool {
        // SAFETY: head always has a successor.
        unsafe { (*self.chain.head()).next() == self.chain.tail() }
    }

    /// Live entries in insertion order.
    pub(crate) fn iter_entries(&self) -> crate::ds::entry::LiveEntries<K, V> {
        self.chain.iter_live()
    }

    /// Removes every mapping.
    pub(crate) fn clear(&self) {
        if self.shared {
            self.clear_shared();
        } else {
            self.clear_local();
        }
    }

    fn clear_local(&self) {
        for entry in self.chain.iter_live() {
            // SAFETY: unshared mode, exclusive access.
            unsafe { (*entry).reset() };
        }
        self.chain.rewind();
        self.publish_state(
            &self.root,
            SegmentState::Leaf(Leaf::new(self.initial_table_len, 0)),
        );
    }

    fn clear_shared(&self) {
        let _guard = self.structure_lock.lock();
        // The detached fragment stays navigable for in-flight iterators and
        // is reclaimed when the map drops.
        let orphans = self.chain.detach_live();
        self.graveyard.lock().entries.extend(orphans);
        self.publish_state(&self.root, SegmentState::Leaf(Leaf::new(C0, 0)));
    }

    /// Restores load-factor headroom for `leaf`: compaction when tombstones
    /// dominate, doubling below the ceiling, otherwise a split.
    fn rebalance(&self, segment: &Segment<K, V>, leaf: &Leaf<K, V>) {
        let entries = leaf.entry_count.load(Ordering::Relaxed);
        let tombstones = leaf.tombstone_count.load(Ordering::Relaxed);
        let len = leaf.slots.len();

        if tombstones > entries {
            // Mostly tombstones: same-size rebuild instead of growth.
            if self.shared {
                let rebuilt = Leaf::new(len, leaf.key_shift);
                self.copy_live(leaf, &rebuilt);
                self.publish_state(segment, SegmentState::Leaf(rebuilt));
            } else {
                self.compact_in_place(leaf);
            }
            return;
        }

        let doubled = len << 1;
        if doubled <= C1 {
            let grown = Leaf::new(doubled, leaf.key_shift);
            self.copy_live(leaf, &grown);
            self.publish_state(segment, SegmentState::Leaf(grown));
            return;
        }

        match self.build_children(leaf, doubled) {
            Some(children) => {
                self.publish_state(
                    segment,
                    SegmentState::Inner {
                        key_shift: leaf.key_shift,
                        children,
                    },
                );
            }
            None => {
                // Skewed hash distribution: give up on the split and keep an
                // oversized leaf past the normal ceiling.
                tracing::warn!(
                    slots = doubled,
                    key_shift = leaf.key_shift,
                    "unevenly distributed key hashes, degraded to an oversized table"
                );
                let grown = Leaf::new(doubled, leaf.key_shift);
                self.copy_live(leaf, &grown);
                self.publish_state(segment, SegmentState::Leaf(grown));
            }
        }
    }

    /// Re-probe-inserts every live entry of `src` into the unpublished `dst`.
    fn copy_live(&self, src: &Leaf<K, V>, dst: &Leaf<K, V>) {
        for slot in src.slots.iter() {
            let entry = slot.load(Ordering::Relaxed);
            if entry.is_null() || entry == self.tombstone {
                continue;
            }
            dst.rebuild_insert(entry);
        }
    }

    /// Same-size rebuild without reallocation. Unshared mode only.
    fn compact_in_place(&self, leaf: &Leaf<K, V>) {
        let live: Vec<*mut Entry<K, V>> = leaf
            .slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&entry| !entry.is_null() && entry != self.tombstone)
            .collect();
        for slot in leaf.slots.iter() {
            slot.store(ptr::null_mut(), Ordering::Relaxed);
        }
        leaf.entry_count.store(0, Ordering::Relaxed);
        leaf.tombstone_count.store(0, Ordering::Relaxed);
        for entry in live {
            leaf.rebuild_insert(entry);
        }
    }

    /// Distributes `leaf`'s live entries over `C2` fresh children, each with
    /// `doubled / C2` slots. Returns `None` if any child would start out past
    /// the 1/2 load factor, which means the hash distribution is too skewed
    /// for a split to help.
    fn build_children(
        &self,
        leaf: &Leaf<K, V>,
        doubled: usize,
    ) -> Option<Box<[Segment<K, V>]>> {
        let child_len = doubled / C2;
        let child_shift = leaf.key_shift + B2;
        let children: Vec<Leaf<K, V>> =
            (0..C2).map(|_| Leaf::new(child_len, child_shift)).collect();

        for slot in leaf.slots.iter() {
            let entry = slot.load(Ordering::Relaxed);
            if entry.is_null() || entry == self.tombstone {
                continue;
            }
            // SAFETY: live entry, as in `get_entry`.
            let key_hash = unsafe { (*entry).key_hash() };
            let index = (key_hash.wrapping_shr(leaf.key_shift) as usize) & (C2 - 1);
            let child = &children[index];
            child.rebuild_insert(entry);
            if child.occupancy() * 2 > child_len {
                return None;
            }
        }

        Some(
            children
                .into_iter()
                .map(|child| Segment::from_state(SegmentState::Leaf(child)))
                .collect(),
        )
    }

    /// Publishes a new state for `segment` and retires the old one.
    fn publish_state(&self, segment: &Segment<K, V>, state: SegmentState<K, V>) {
        let fresh = Box::into_raw(Box::new(state));
        let old = segment.state.swap(fresh, Ordering::AcqRel);
        if self.shared {
            self.graveyard.lock().states.push(old);
        } else {
            // SAFETY: unshared mode has no concurrent snapshot holders.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    fn retire_value(&self, value: *mut V) {
        if value.is_null() {
            return;
        }
        if self.shared {
            self.graveyard.lock().values.push(value);
        } else {
            // SAFETY: unshared mode, the swapped-out box is exclusively ours.
            unsafe { drop(Box::from_raw(value)) };
        }
    }

    /// Diagnostic snapshot: sizes, depth, probe-distance quality.
    pub(crate) fn statistics(&self) -> CacheStatistics {
        let size = self.len();
        let (sum_distance, max_distance) = self.distances();
        CacheStatistics {
            size,
            entries: self.chain.allocated().saturating_sub(2),
            slots: self.slot_count(),
            sub_map_depth: self.depth(),
            tombstones: self.tombstone_total(),
            shared: self.shared,
            avg_distance_percent: if size != 0 { 100 * sum_distance / size } else { 0 },
            max_distance,
        }
    }

    fn slot_count(&self) -> usize {
        fn count<K, V>(segment: &Segment<K, V>) -> usize {
            match segment.state() {
                SegmentState::Leaf(leaf) => leaf.slots.len(),
                SegmentState::Inner { children, .. } => children.iter().map(count).sum(),
            }
        }
        count(&self.root)
    }

    fn tombstone_total(&self) -> usize {
        fn count<K, V>(segment: &Segment<K, V>) -> usize {
            match segment.state() {
                SegmentState::Leaf(leaf) => leaf.tombstone_count.load(Ordering::Relaxed),
                SegmentState::Inner { children, .. } => children.iter().map(count).sum(),
            }
        }
        count(&self.root)
    }

    fn depth(&self) -> usize {
        fn depth_of<K, V>(segment: &Segment<K, V>) -> usize {
            match segment.state() {
                SegmentState::Leaf(_) => 0,
                SegmentState::Inner { children, .. } => {
                    1 + children.iter().map(depth_of).max().unwrap_or(0)
                }
            }
        }
        depth_of(&self.root)
    }

    fn distances(&self) -> (usize, usize) {
        let mut sum = 0;
        let mut max = 0;
        self.for_each_leaf(&self.root, &mut |leaf| {
            let len = leaf.slots.len();
            let mask = leaf.mask();
            for (index, slot) in leaf.slots.iter().enumerate() {
                let entry = slot.load(Ordering::Relaxed);
                if entry.is_null() || entry == self.tombstone {
                    continue;
                }
                // SAFETY: live entry.
                let home = leaf.probe_start(unsafe { (*entry).key_hash() }) & mask;
                let distance = if index >= home {
                    index - home
                } else {
                    index + len - home
                };
                sum += distance;
                max = max.max(distance);
            }
        });
        (sum, max)
    }

    fn for_each_leaf(&self, segment: &Segment<K, V>, f: &mut impl FnMut(&Leaf<K, V>)) {
        match segment.state() {
            SegmentState::Leaf(leaf) => f(leaf),
            SegmentState::Inner { children, .. } => {
                for child in children.iter() {
                    self.for_each_leaf(child, f);
                }
            }
        }
    }

    /// Verifies the structural invariants. Intended for tests and debugging.
    pub(crate) fn check_invariants(&self) -> Result<(), InvariantError> {
        self.check_segment(&self.root, 0)?;
        self.check_chain()?;
        Ok(())
    }

    fn check_segment(&self, segment: &Segment<K, V>, expected_shift: u32) -> Result<(), InvariantError> {
        match segment.state() {
            SegmentState::Leaf(leaf) => self.check_leaf(leaf, expected_shift),
            SegmentState::Inner {
                key_shift,
                children,
            } => {
                if *key_shift != expected_shift {
                    return Err(InvariantError::new(format!(
                        "inner key_shift {} != expected {}",
                        key_shift, expected_shift
                    )));
                }
                if children.len() != C2 {
                    return Err(InvariantError::new("inner fan-out is not C2"));
                }
                for child in children.iter() {
                    self.check_segment(child, expected_shift + B2)?;
                }
                Ok(())
            }
        }
    }

    fn check_leaf(&self, leaf: &Leaf<K, V>, expected_shift: u32) -> Result<(), InvariantError> {
        if leaf.key_shift != expected_shift {
            return Err(InvariantError::new(format!(
                "leaf key_shift {} != expected {}",
                leaf.key_shift, expected_shift
            )));
        }
        let len = leaf.slots.len();
        if !len.is_power_of_two() {
            return Err(InvariantError::new("leaf length is not a power of two"));
        }

        let mut live = 0;
        let mut tombstones = 0;
        for (index, slot) in leaf.slots.iter().enumerate() {
            let entry = slot.load(Ordering::Relaxed);
            if entry.is_null() {
                continue;
            }
            if entry == self.tombstone {
                tombstones += 1;
                continue;
            }
            live += 1;
            // Probe reachability: walking from the home slot must reach the
            // entry without crossing an empty slot.
            // SAFETY: live entry.
            let home = leaf.probe_start(unsafe { (*entry).key_hash() });
            let mask = leaf.mask();
            let mut reached = false;
            for step in 0..len {
                let probe_index = (home + step) & mask;
                if probe_index == index {
                    reached = true;
                    break;
                }
                if leaf.slots[probe_index].load(Ordering::Relaxed).is_null() {
                    break;
                }
            }
            if !reached {
                return Err(InvariantError::new(format!(
                    "entry at slot {} unreachable from its probe start",
                    index
                )));
            }
        }

        if live != leaf.entry_count.load(Ordering::Relaxed) {
            return Err(InvariantError::new("leaf entry_count mismatch"));
        }
        if tombstones != leaf.tombstone_count.load(Ordering::Relaxed) {
            return Err(InvariantError::new("leaf tombstone_count mismatch"));
        }
        if live + tombstones > len / 2 {
            return Err(InvariantError::new(format!(
                "leaf over half full: {} live + {} tombstones in {} slots",
                live, tombstones, len
            )));
        }
        Ok(())
    }

    fn check_chain(&self) -> Result<(), InvariantError> {
        let mut live = 0;
        let mut previous = self.chain.head();
        for entry in self.chain.iter_live() {
            // SAFETY: live entries are valid and single-writer mutated.
            let e = unsafe { &*entry };
            if e.prev() != previous {
                return Err(InvariantError::new("chain back-link mismatch"));
            }
            if e.key().is_none() {
                return Err(InvariantError::new("live entry with no key"));
            }
            if e.value_ref().is_none() {
                return Err(InvariantError::new("live entry with no value"));
            }
            live += 1;
            previous = entry;
        }
        if live != self.len() {
            return Err(InvariantError::new(format!(
                "chain live count {} != table size {}",
                live,
                self.len()
            )));
        }
        // Unshared chains never orphan entries: everything ever allocated
        // stays reachable from head.
        if !self.shared && self.chain.total_len() != self.chain.allocated() {
            return Err(InvariantError::new(format!(
                "chain walk found {} entries but {} were allocated",
                self.chain.total_len(),
                self.chain.allocated()
            )));
        }
        Ok(())
    }
}

impl<K, V> Drop for SegmentMap<K, V> {
    fn drop(&mut self) {
        // SAFETY: the tombstone is allocated in `new` and owned by the map.
        unsafe { drop(Box::from_raw(self.tombstone)) };
    }
}
