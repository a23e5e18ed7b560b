//! Builder for both cache facades.
//!
//! Collects the tunables (capacity, TTLs, cleanup threshold, clock) and
//! produces either an unshared [`SearchCache`] or a [`SharedSearchCache`].
//! TTL units are ticker ticks; with the default [`SystemClock`] one tick is
//! one millisecond of wall clock.
//!
//! ## Example
//!
//! ```rust
//! use searchcache::builder::SearchCacheBuilder;
//!
//! let mut cache = SearchCacheBuilder::new()
//!     .initial_capacity(64)
//!     .expire_after_access(2_000)
//!     .expire_after_write(10_000)
//!     .build::<u64, String>();
//! cache.put(1, "hello".to_string());
//! assert_eq!(cache.get(&1), Some(&"hello".to_string()));
//! ```

use std::hash::Hash;

use crate::cache::{
    CacheCore, SearchCache, SharedSearchCache, DEFAULT_ACCESS_TTL, DEFAULT_CAPACITY,
    DEFAULT_CREATE_TTL,
};
use crate::error::ConfigError;
use crate::ticker::{Clock, SystemClock, Tick, CLEANUP_TIME_THRESHOLD};

/// Builder collecting cache configuration.
pub struct SearchCacheBuilder {
    initial_capacity: usize,
    access_ttl: Tick,
    create_ttl: Tick,
    cleanup_threshold: Tick,
    clock: Box<dyn Clock>,
}

impl SearchCacheBuilder {
    /// Creates a builder with the defaults: capacity 1000, access TTL 200,
    /// write TTL 600, cleanup threshold 50, wall-clock milliseconds.
    pub fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_CAPACITY,
            access_ttl: DEFAULT_ACCESS_TTL,
            create_ttl: DEFAULT_CREATE_TTL,
            cleanup_threshold: CLEANUP_TIME_THRESHOLD,
            clock: Box::new(SystemClock),
        }
    }

    /// Number of entries preallocated in the reservoir; also sizes the
    /// initial table.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// TTL for the expire-after-access policy, in ticks.
    pub fn expire_after_access(mut self, ttl: Tick) -> Self {
        self.access_ttl = ttl;
        self
    }

    /// TTL for the expire-after-write policy, in ticks.
    pub fn expire_after_write(mut self, ttl: Tick) -> Self {
        self.create_ttl = ttl;
        self
    }

    /// Minimum tick delta between two cleanup sweeps.
    pub fn cleanup_threshold(mut self, threshold: Tick) -> Self {
        self.cleanup_threshold = threshold;
        self
    }

    /// Replaces the timestamp source consulted on each write.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Builds an unshared cache.
    pub fn build<K, V>(self) -> SearchCache<K, V>
    where
        K: Eq + Hash + Clone,
    {
        SearchCache::from_core(self.into_core(false))
    }

    /// Builds a shared cache.
    pub fn build_shared<K, V>(self) -> SharedSearchCache<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        SharedSearchCache::from_core(self.into_core(true))
    }

    /// Builds an unshared cache, validating the configuration.
    pub fn try_build<K, V>(self) -> Result<SearchCache<K, V>, ConfigError>
    where
        K: Eq + Hash + Clone,
    {
        self.validate()?;
        Ok(self.build())
    }

    /// Builds a shared cache, validating the configuration.
    pub fn try_build_shared<K, V>(self) -> Result<SharedSearchCache<K, V>, ConfigError>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        self.validate()?;
        Ok(self.build_shared())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.access_ttl <= 0 {
            return Err(ConfigError::new("access TTL must be positive"));
        }
        if self.create_ttl <= 0 {
            return Err(ConfigError::new("write TTL must be positive"));
        }
        if self.cleanup_threshold <= 0 {
            return Err(ConfigError::new("cleanup threshold must be positive"));
        }
        Ok(())
    }

    fn into_core<K, V>(self, shared: bool) -> CacheCore<K, V>
    where
        K: Eq + Hash + Clone,
    {
        CacheCore::new(
            self.initial_capacity,
            self.access_ttl,
            self.create_ttl,
            self.cleanup_threshold,
            self.clock,
            shared,
        )
    }
}

impl Default for SearchCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
