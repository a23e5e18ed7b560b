//! searchcache: an in-process key/value lookup accelerator.
//!
//! High read throughput, bounded memory, and continuous background freshness
//! from two independent time-based eviction policies (expire-after-write and
//! expire-after-access). Storage is a segmented open-addressed hash table
//! that doubles smoothly up to a ceiling and then partitions recursively
//! into sub-segments, threaded by an insertion-order chain that recycles
//! entries and lets eviction sweep oldest-first in bounded time.
//!
//! Two facades cover the two concurrency modes: [`cache::SearchCache`] for a
//! single owner, [`cache::SharedSearchCache`] for concurrent readers under a
//! single-writer serialization regime with a lock-free read path.

mod ds;

pub mod builder;
pub mod cache;
pub mod compare;
pub mod error;
pub mod prelude;
pub mod stats;
pub mod ticker;
