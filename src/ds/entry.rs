//! Cache entries and the insertion-order chain with its recycling reservoir.
//!
//! Every live mapping is one heap-allocated `Entry` that is simultaneously
//! (a) referenced by exactly one slot of one leaf table and (b) linked into a
//! single doubly linked chain that records insertion order.
//!
//! ## Architecture
//!
//! ```text
//!   head ◄──► e1 ◄──► e2 ◄──► e3 ◄──► tail ──► r1 ──► r2 ──► null
//!   fixed     └── live, insertion order ──┘    └── reservoir ──┘
//! ```
//!
//! `head` never moves. `tail` is the pivot between live entries and the
//! reservoir of pre-allocated, uninitialized entries: an insert consumes the
//! entry `tail` points at and advances `tail` forward. When the reservoir
//! runs dry it is refilled [`ENTRY_BATCH`] entries at a time. An unshared
//! removal re-links the freed entry immediately after `tail`, so steady-state
//! churn allocates nothing.
//!
//! ## Concurrency
//!
//! Exactly one writer mutates the chain at a time (the facade's `&mut`
//! receiver in unshared mode, the structural mutex in shared mode). Links and
//! timestamps are atomics so shared-mode readers can chase them while the
//! writer edits; key cells are only written before an entry is published or
//! while no reader can hold it.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crate::ticker::Tick;

/// Access-time sentinel: the entry has never been read, so no access
/// threshold can expire it.
pub(crate) const NEVER_ACCESSED: Tick = Tick::MAX;

/// Creation-time sentinel: the entry has not been stamped by a write yet.
pub(crate) const NEVER_CREATED: Tick = 0;

/// Reservoir refill size.
pub(crate) const ENTRY_BATCH: usize = 8;

/// One key/value mapping, doubly linked into the insertion-order chain.
///
/// The key cell is written only by the single writer; the value is a boxed
/// pointer swapped atomically so overwrites are safe against lock-free
/// readers; both timestamps race benignly (last writer wins).
pub(crate) struct Entry<K, V> {
    next: AtomicPtr<Entry<K, V>>,
    prev: AtomicPtr<Entry<K, V>>,
    key: UnsafeCell<Option<K>>,
    value: AtomicPtr<V>,
    key_hash: AtomicI32,
    access_time: AtomicI64,
    creation_time: AtomicI64,
}

impl<K, V> Entry<K, V> {
    /// Allocates an unlinked, unset entry.
    pub(crate) fn new_boxed() -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            key: UnsafeCell::new(None),
            value: AtomicPtr::new(ptr::null_mut()),
            key_hash: AtomicI32::new(0),
            access_time: AtomicI64::new(NEVER_ACCESSED),
            creation_time: AtomicI64::new(NEVER_CREATED),
        })
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut Entry<K, V> {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: *mut Entry<K, V>) {
        self.next.store(next, Ordering::Release);
    }

    #[inline]
    pub(crate) fn prev(&self) -> *mut Entry<K, V> {
        self.prev.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_prev(&self, prev: *mut Entry<K, V>) {
        self.prev.store(prev, Ordering::Release);
    }

    /// Returns the key, if set.
    #[inline]
    pub(crate) fn key(&self) -> Option<&K> {
        // SAFETY: the key cell is written only by the single writer, and only
        // while the entry is unpublished (reservoir) or unreachable by
        // readers (unshared recycle/clear). Published entries expose an
        // immutable key.
        unsafe { (*self.key.get()).as_ref() }
    }

    /// Replaces the key, returning the previous one.
    #[inline]
    pub(crate) fn set_key(&self, key: Option<K>) -> Option<K> {
        // SAFETY: same single-writer discipline as `key`.
        unsafe { std::mem::replace(&mut *self.key.get(), key) }
    }

    #[inline]
    pub(crate) fn key_hash(&self) -> i32 {
        self.key_hash.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_key_hash(&self, hash: i32) {
        self.key_hash.store(hash, Ordering::Relaxed);
    }

    /// Returns a reference to the current value, if set.
    #[inline]
    pub(crate) fn value_ref(&self) -> Option<&V> {
        let value = self.value.load(Ordering::Acquire);
        if value.is_null() {
            None
        } else {
            // SAFETY: value boxes are never freed while the owning map is
            // alive (shared mode retires them to the graveyard; unshared mode
            // frees them only under exclusive access).
            Some(unsafe { &*value })
        }
    }

    /// Stores a freshly boxed value, returning the previous box.
    #[inline]
    pub(crate) fn replace_value(&self, value: *mut V) -> *mut V {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Takes the value out of the entry. Only valid when no reader can hold
    /// the box (unshared mode, or at drop).
    pub(crate) fn take_value(&self) -> Option<V> {
        let value = self.value.swap(ptr::null_mut(), Ordering::AcqRel);
        if value.is_null() {
            None
        } else {
            // SAFETY: the pointer came from `Box::into_raw` and ownership is
            // exclusive once swapped out.
            Some(*unsafe { Box::from_raw(value) })
        }
    }

    #[inline]
    pub(crate) fn access_time(&self) -> Tick {
        self.access_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_access_time(&self, tick: Tick) {
        self.access_time.store(tick, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn creation_time(&self) -> Tick {
        self.creation_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_creation_time(&self, tick: Tick) {
        self.creation_time.store(tick, Ordering::Relaxed);
    }

    /// Resets key, value and timestamps to the unset state, dropping whatever
    /// was held. Only valid under exclusive access.
    pub(crate) fn reset(&self) {
        drop(self.set_key(None));
        drop(self.take_value());
        self.set_creation_time(NEVER_CREATED);
        self.set_access_time(NEVER_ACCESSED);
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        let value = self.value.swap(ptr::null_mut(), Ordering::Relaxed);
        if !value.is_null() {
            // SAFETY: an entry being dropped exclusively owns its value box.
            unsafe { drop(Box::from_raw(value)) };
        }
    }
}

/// Insertion-order chain plus recycling reservoir.
///
/// Owns every entry reachable from `head` via `next` links; entries detached
/// by a shared-mode clear are handed to the caller for deferred reclamation.
pub(crate) struct EntryChain<K, V> {
    head: *mut Entry<K, V>,
    tail: AtomicPtr<Entry<K, V>>,
    allocated: AtomicUsize,
}

impl<K, V> EntryChain<K, V> {
    /// Builds a chain with `capacity` reservoir entries behind the tail
    /// pivot.
    pub(crate) fn new(capacity: usize) -> Self {
        let head = Box::into_raw(Entry::new_boxed());
        let tail = Box::into_raw(Entry::new_boxed());
        // SAFETY: both entries were just allocated and are exclusively owned.
        unsafe {
            (*head).set_next(tail);
            (*tail).set_prev(head);
        }

        let chain = Self {
            head,
            tail: AtomicPtr::new(tail),
            allocated: AtomicUsize::new(2),
        };
        chain.append_reservoir(tail, capacity);
        chain
    }

    #[inline]
    pub(crate) fn head(&self) -> *mut Entry<K, V> {
        self.head
    }

    #[inline]
    pub(crate) fn tail(&self) -> *mut Entry<K, V> {
        self.tail.load(Ordering::Acquire)
    }

    /// Total entries ever allocated for this chain, sentinels included.
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the next free entry (the tail pivot), refilling the reservoir
    /// first if it is exhausted. The caller fills the entry and then calls
    /// [`advance_tail`](Self::advance_tail) to consume it.
    pub(crate) fn reserve(&self) -> *mut Entry<K, V> {
        let tail = self.tail();
        // SAFETY: tail is always a valid chain entry; only the single writer
        // calls reserve.
        if unsafe { (*tail).next() }.is_null() {
            self.append_reservoir(tail, ENTRY_BATCH);
        }
        tail
    }

    /// Advances the tail pivot past the entry just consumed.
    pub(crate) fn advance_tail(&self) {
        let tail = self.tail();
        // SAFETY: `reserve` guaranteed a successor exists.
        let next = unsafe { (*tail).next() };
        self.tail.store(next, Ordering::Release);
    }

    /// Detaches `entry` from the chain. The entry keeps its own links so a
    /// concurrent shared-mode iterator standing on it can escape forward.
    pub(crate) fn unlink(&self, entry: *mut Entry<K, V>) {
        // SAFETY: entry is live, therefore strictly between head and tail,
        // so both neighbors exist; structural edits are single-writer.
        unsafe {
            let prev = (*entry).prev();
            let next = (*entry).next();
            (*prev).set_next(next);
            (*next).set_prev(prev);
        }
    }

    /// Resets a detached entry and re-links it right after the tail pivot,
    /// making it the next allocation. Unshared mode only.
    pub(crate) fn recycle(&self, entry: *mut Entry<K, V>) {
        let tail = self.tail();
        // SAFETY: entry was unlinked by this writer and no reader can hold it
        // (unshared mode).
        unsafe {
            (*entry).reset();
            let next = (*tail).next();
            (*entry).set_prev(tail);
            (*entry).set_next(next);
            (*tail).set_next(entry);
            if !next.is_null() {
                (*next).set_prev(entry);
            }
        }
    }

    /// Rewinds the tail pivot to the first entry, turning the whole chain
    /// back into reservoir. Unshared clear only; the caller has already reset
    /// the formerly live entries.
    pub(crate) fn rewind(&self) {
        // SAFETY: head always has a successor.
        let first = unsafe { (*self.head).next() };
        self.tail.store(first, Ordering::Release);
    }

    /// Detaches every live entry, reconnecting head directly to tail, and
    /// returns the orphans. Shared clear only: the orphans may still be
    /// visited by in-flight readers and must outlive them.
    pub(crate) fn detach_live(&self) -> Vec<*mut Entry<K, V>> {
        let tail = self.tail();
        let mut orphans = Vec::new();
        // SAFETY: traversal below walks the live region only; structural
        // edits are serialized by the caller's mutex.
        unsafe {
            let mut entry = (*self.head).next();
            while entry != tail && !entry.is_null() {
                orphans.push(entry);
                entry = (*entry).next();
            }
            (*self.head).set_next(tail);
            (*tail).set_prev(self.head);
        }
        orphans
    }

    /// Iterates the live region: every entry strictly between head and the
    /// tail pivot captured at creation, in insertion order.
    pub(crate) fn iter_live(&self) -> LiveEntries<K, V> {
        LiveEntries {
            current: self.head,
            end: self.tail(),
        }
    }

    /// Total chain length from head to the end of the reservoir.
    pub(crate) fn total_len(&self) -> usize {
        let mut count = 0;
        let mut entry = self.head;
        while !entry.is_null() {
            count += 1;
            // SAFETY: chain links always point at live allocations or null.
            entry = unsafe { (*entry).next() };
        }
        count
    }

    fn append_reservoir(&self, after: *mut Entry<K, V>, count: usize) {
        let mut previous = after;
        for _ in 0..count {
            let entry = Box::into_raw(Entry::new_boxed());
            // SAFETY: `entry` is fresh; `previous` is the current chain end.
            unsafe {
                (*entry).set_prev(previous);
                (*previous).set_next(entry);
            }
            previous = entry;
        }
        self.allocated.fetch_add(count, Ordering::Relaxed);
    }
}

impl<K, V> Drop for EntryChain<K, V> {
    fn drop(&mut self) {
        let mut entry = self.head;
        while !entry.is_null() {
            // SAFETY: every entry reachable from head is owned by the chain;
            // detached orphans were removed from this walk.
            unsafe {
                let next = (*entry).next();
                drop(Box::from_raw(entry));
                entry = next;
            }
        }
    }
}

/// Forward iterator over the live region of a chain.
pub(crate) struct LiveEntries<K, V> {
    current: *mut Entry<K, V>,
    end: *mut Entry<K, V>,
}

impl<K, V> Iterator for LiveEntries<K, V> {
    type Item = *mut Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `current` is head or a previously yielded live entry; its
        // next link is valid for the lifetime of the map.
        let next = unsafe { (*self.current).next() };
        if next.is_null() || next == self.end {
            return None;
        }
        self.current = next;
        Some(next)
    }
}
