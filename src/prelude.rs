//! Convenience re-exports of the public surface.

pub use crate::builder::SearchCacheBuilder;
pub use crate::cache::{SearchCache, SharedSearchCache};
pub use crate::compare::{DefaultEquivalence, Equivalence};
pub use crate::error::{ConfigError, InvariantError};
pub use crate::stats::CacheStatistics;
pub use crate::ticker::{Clock, ManualClock, SystemClock, Tick, Ticker};
