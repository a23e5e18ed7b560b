//! Diagnostic snapshot of the storage engine.
//!
//! The snapshot is advisory: it helps spot poorly distributed hash functions
//! (average probe distance should stay well under 100% of size, most entries
//! in or near their home slot) and confirms whether the tree has split into
//! sub-segments. Its exact rendering is not part of the contract.

use std::fmt;

/// Point-in-time view of the cache's storage shape and probe quality.
///
/// Produced by [`SearchCache::statistics`](crate::cache::SearchCache::statistics)
/// and [`SharedSearchCache::statistics`](crate::cache::SharedSearchCache::statistics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Live mappings.
    pub size: usize,
    /// Entries allocated to the chain (live plus reservoir).
    pub entries: usize,
    /// Total table slots across all leaves.
    pub slots: usize,
    /// Depth of the sub-segment tree (0 = the root is still a leaf).
    pub sub_map_depth: usize,
    /// Tombstoned slots across all leaves.
    pub tombstones: usize,
    /// Whether the cache runs in shared mode.
    pub shared: bool,
    /// Sum of probe distances as a percentage of size.
    pub avg_distance_percent: usize,
    /// Largest probe distance of any live entry.
    pub max_distance: usize,
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SIZE: {}, ENTRIES: {}, SLOTS: {}, SUB-MAP DEPTH: {}, TOMBSTONES: {}, \
             SHARED: {}, AVG DISTANCE: {}%, MAX DISTANCE: {}",
            self.size,
            self.entries,
            self.slots,
            self.sub_map_depth,
            self.tombstones,
            self.shared,
            self.avg_distance_percent,
            self.max_distance,
        )
    }
}
