//! Timestamp plumbing: the tick domain, the wall-clock source, and the
//! cleanup-rate gate.
//!
//! The cache never reads the clock on the read path. Each write samples a
//! [`Clock`] once and caches the result in the [`Ticker`]; reads reuse the
//! cached value when stamping access times. The ticker doubles as the
//! cleanup-rate gate: a sweep only runs when enough ticks have elapsed since
//! the previous sweep.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Integer timestamp. Default calibration is 1 tick = 1 ms of wall clock,
/// but any monotonically non-decreasing integer source works.
pub type Tick = i64;

/// Minimum tick delta between two cleanup sweeps.
pub const CLEANUP_TIME_THRESHOLD: Tick = 50;

/// Source of the current tick, sampled once per write.
pub trait Clock: Send + Sync {
    /// Returns the current tick.
    fn now(&self) -> Tick;
}

/// Wall-clock source: milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as Tick)
            .unwrap_or(0)
    }
}

/// Caller-driven clock for embedders that manage time themselves.
///
/// Clones share the same underlying tick, so a test (or a host scheduler)
/// can keep a handle while the cache owns another.
///
/// # Example
///
/// ```
/// use searchcache::ticker::{Clock, ManualClock};
///
/// let clock = ManualClock::new(0);
/// let handle = clock.clone();
/// handle.advance(25);
/// assert_eq!(clock.now(), 25);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    tick: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: Tick) -> Self {
        Self {
            tick: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Sets the current tick.
    pub fn set(&self, tick: Tick) {
        self.tick.store(tick, Ordering::Relaxed);
    }

    /// Advances the current tick by `delta`.
    pub fn advance(&self, delta: Tick) {
        self.tick.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.tick.load(Ordering::Relaxed)
    }
}

/// Reusable timestamp cache and cleanup gate.
///
/// `next_tick` is the latest timestamp supplied by a writer; `prev_tick`
/// records when the last cleanup sweep ran. The ticker is not a clock: its
/// value only moves when a caller stores one.
#[derive(Debug)]
pub struct Ticker {
    next_tick: AtomicI64,
    prev_tick: AtomicI64,
    cleanup_threshold: AtomicI64,
}

impl Ticker {
    /// Creates a ticker with both marks at `tick` and the default cleanup
    /// threshold.
    pub fn new(tick: Tick) -> Self {
        Self::with_threshold(tick, CLEANUP_TIME_THRESHOLD)
    }

    /// Creates a ticker with an explicit cleanup threshold.
    pub fn with_threshold(tick: Tick, threshold: Tick) -> Self {
        Self {
            next_tick: AtomicI64::new(tick),
            prev_tick: AtomicI64::new(tick),
            cleanup_threshold: AtomicI64::new(threshold),
        }
    }

    /// Returns the cached timestamp.
    #[inline]
    pub fn next_tick(&self) -> Tick {
        self.next_tick.load(Ordering::Relaxed)
    }

    /// Caches a new timestamp.
    #[inline]
    pub fn set_next_tick(&self, tick: Tick) {
        self.next_tick.store(tick, Ordering::Relaxed);
    }

    /// Returns `true` if not enough ticks have elapsed since the last sweep.
    #[inline]
    pub fn skip_cleanup(&self) -> bool {
        let threshold = self.cleanup_threshold.load(Ordering::Relaxed);
        self.next_tick() - self.prev_tick.load(Ordering::Relaxed) < threshold
    }

    /// Records that a sweep ran at the cached timestamp.
    #[inline]
    pub fn mark_cleanup(&self) {
        self.prev_tick.store(self.next_tick(), Ordering::Relaxed);
    }

    /// Replaces the cleanup threshold.
    pub fn set_cleanup_threshold(&self, threshold: Tick) {
        self.cleanup_threshold.store(threshold, Ordering::Relaxed);
    }
}
