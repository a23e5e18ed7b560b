// ==============================================
// CACHE INVARIANT TESTS (integration)
// ==============================================
//
// Scenario and property coverage that spans the whole public surface:
// growth, splitting, insertion order, recycling, the two TTL policies and
// the cleanup work bound. Random workloads are cross-checked against a
// plain FxHashMap model.

use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use searchcache::prelude::*;

fn frozen_clock_cache(capacity: usize) -> SearchCache<u64, u64> {
    // A clock pinned at zero keeps the cleanup gate closed, so these tests
    // exercise pure map semantics with no expiry interference.
    SearchCacheBuilder::new()
        .initial_capacity(capacity)
        .clock(ManualClock::new(0))
        .build()
}

// ==============================================
// Scenarios
// ==============================================

mod scenarios {
    use super::*;

    // S1: basic put/get/overwrite.
    #[test]
    fn s1_basic() {
        let mut cache = SearchCache::new();
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 3);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get(&"a"), Some(&3));
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), None);
    }

    // S2: growth from a small table keeps every key reachable with sane
    // probe distances.
    #[test]
    fn s2_growth() {
        let mut cache = frozen_clock_cache(16);
        for key in 0..1_000u64 {
            cache.put(key, key + 1);
        }
        assert_eq!(cache.size(), 1_000);
        for key in 0..1_000u64 {
            assert_eq!(cache.get(&key), Some(&(key + 1)), "key {key}");
        }
        let stats = cache.statistics();
        assert!(
            stats.max_distance < stats.slots / 4,
            "max probe distance {} too large for {} slots",
            stats.max_distance,
            stats.slots
        );
        cache.check_invariants().unwrap();
    }

    // S3: pushing past the resize ceiling splits the root into sub-maps.
    #[test]
    fn s3_split() {
        let mut cache = frozen_clock_cache(16);
        for key in 0..3_000u64 {
            cache.put(key, key);
        }
        assert_eq!(cache.size(), 3_000);
        let stats = cache.statistics();
        assert!(stats.sub_map_depth >= 1, "root should have split: {stats}");
        for key in 0..3_000u64 {
            assert_eq!(cache.get(&key), Some(&key), "key {key}");
        }
        cache.check_invariants().unwrap();
    }

    // S4 (adjusted to the access-sentinel contract): an entry that has been
    // read expires once its access timestamp ages past the access TTL, while
    // a never-read sibling with the same creation time survives.
    #[test]
    fn s4_access_expiry() {
        let clock = ManualClock::new(0);
        let mut cache: SearchCache<&str, u64> = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(200)
            .expire_after_write(10_000)
            .clock(clock.clone())
            .build();
        cache.put("read", 1);
        cache.put("unread", 2);
        assert_eq!(cache.get(&"read"), Some(&1));

        clock.set(260);
        cache.put("k2", 3);
        assert_eq!(cache.get(&"read"), None, "stale access timestamp");
        assert!(cache.contains_key(&"unread"), "access sentinel shields it");
        assert!(cache.contains_key(&"k2"));
    }

    // S5: the write TTL fires even when the entry was accessed recently.
    #[test]
    fn s5_write_expiry_overrides_access() {
        let clock = ManualClock::new(0);
        let mut cache: SearchCache<&str, u64> = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(200)
            .expire_after_write(300)
            .clock(clock.clone())
            .build();
        cache.put("k", 1);
        for tick in [100i64, 200] {
            clock.set(tick);
            // A put refreshes the cached tick, then the read stamps it.
            cache.put("warm", tick as u64);
            assert_eq!(cache.get(&"k"), Some(&1), "still alive at {tick}");
        }
        clock.set(360);
        cache.put("x", 9);
        // The access timestamp (200) is within the access TTL at tick 360,
        // so only the creation TTL can explain the eviction.
        assert_eq!(cache.get(&"k"), None, "creation TTL must override access");
    }

    // S6: two writes inside the cleanup threshold perform no cleanup work.
    #[test]
    fn s6_cleanup_gate() {
        let clock = ManualClock::new(0);
        let mut cache: SearchCache<&str, u64> = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(10_000)
            .expire_after_write(10)
            .clock(clock.clone())
            .build();
        cache.put("stale", 1);
        clock.set(40);
        // "stale" is past its write TTL, but the gate is still closed.
        cache.put("b", 2);
        assert_eq!(cache.size(), 2);
        assert!(cache.contains_key(&"stale"));
    }
}

// ==============================================
// Expiry Properties
// ==============================================

mod expiry {
    use super::*;

    // Property 8: inserted at t0 and never read, gone by the first put
    // after t0 + createTTL + CLEANUP_TIME_THRESHOLD.
    #[test]
    fn expire_after_write_bound() {
        let clock = ManualClock::new(0);
        let mut cache: SearchCache<u64, u64> = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(1_000_000)
            .expire_after_write(600)
            .clock(clock.clone())
            .build();
        cache.put(1, 1);
        clock.set(600 + 50 + 1);
        cache.put(2, 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(&2));
    }

    // Property 9: last read at tr, gone by the first put after
    // tr + accessTTL + CLEANUP_TIME_THRESHOLD.
    #[test]
    fn expire_after_access_bound() {
        let clock = ManualClock::new(0);
        let mut cache: SearchCache<u64, u64> = SearchCacheBuilder::new()
            .initial_capacity(16)
            .expire_after_access(200)
            .expire_after_write(1_000_000)
            .clock(clock.clone())
            .build();
        cache.put(1, 1);

        // Refresh the cached tick, then read to stamp the access time.
        clock.set(1_000);
        cache.put(2, 2);
        assert_eq!(cache.get(&1), Some(&1));

        clock.set(1_000 + 200 + 51);
        cache.put(3, 3);
        assert_eq!(cache.get(&1), None);
        // Key 2 was never read: the access sentinel shields it.
        assert!(cache.contains_key(&2));
        assert_eq!(cache.get(&3), Some(&3));
    }
}

// ==============================================
// Insertion Order
// ==============================================

mod insertion_order {
    use super::*;

    #[test]
    fn iteration_matches_insertion_even_after_removals() {
        let mut cache = frozen_clock_cache(16);
        let keys: Vec<u64> = (0..200).collect();
        for &key in &keys {
            cache.put(key, key);
        }
        // Remove every third key; survivors must keep their relative order.
        for key in keys.iter().filter(|k| *k % 3 == 0) {
            cache.remove(key);
        }
        let expected: Vec<u64> = keys.iter().copied().filter(|k| k % 3 != 0).collect();
        let observed: Vec<u64> = cache.iter().map(|(k, _)| *k).collect();
        assert_eq!(observed, expected);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn overwrite_does_not_reorder() {
        let mut cache = frozen_clock_cache(16);
        for key in [10u64, 20, 30] {
            cache.put(key, key);
        }
        cache.put(10, 11);
        let observed: Vec<u64> = cache.iter().map(|(k, _)| *k).collect();
        assert_eq!(observed, vec![10, 20, 30]);
    }
}

// ==============================================
// Entry Recycling
// ==============================================

mod recycling {
    use super::*;

    // Property 6: churn bounded by the initial capacity allocates nothing
    // beyond the reservoir.
    #[test]
    fn steady_churn_reuses_the_reservoir() {
        let mut cache = frozen_clock_cache(8);
        let baseline = cache.statistics().entries;
        for round in 0..200u64 {
            cache.put(round, round);
            cache.remove(&round);
        }
        assert_eq!(cache.statistics().entries, baseline);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn reservoir_grows_in_batches_of_eight() {
        let mut cache = frozen_clock_cache(4);
        let baseline = cache.statistics().entries;
        // Push one entry past the preallocated reservoir.
        for key in 0..=(baseline as u64) {
            cache.put(key, key);
        }
        let grown = cache.statistics().entries;
        assert_eq!((grown - baseline) % 8, 0);
        assert!(grown > baseline);
    }

    #[test]
    fn invalidate_all_recycles_everything() {
        let mut cache = frozen_clock_cache(16);
        for key in 0..64u64 {
            cache.put(key, key);
        }
        let allocated = cache.statistics().entries;
        cache.invalidate_all();
        for key in 0..64u64 {
            cache.put(key, key);
        }
        assert_eq!(cache.statistics().entries, allocated);
    }
}

// ==============================================
// Random Workloads vs Model
// ==============================================

mod random_model {
    use super::*;

    #[derive(Debug, Clone)]
    enum Op {
        Put(u16, u32),
        Remove(u16),
        Get(u16),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u16>(), any::<u32>()).prop_map(|(k, v)| Op::Put(k % 512, v)),
            any::<u16>().prop_map(|k| Op::Remove(k % 512)),
            any::<u16>().prop_map(|k| Op::Get(k % 512)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Properties 1 and 2: membership round-trip and overwrite, against
        // a std-map model.
        #[test]
        fn behaves_like_a_hash_map(ops in proptest::collection::vec(op_strategy(), 1..400)) {
            let mut cache: SearchCache<u16, u32> = SearchCacheBuilder::new()
                .initial_capacity(16)
                .clock(ManualClock::new(0))
                .build();
            let mut model: FxHashMap<u16, u32> = FxHashMap::default();

            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        cache.put(k, v);
                        model.insert(k, v);
                    }
                    Op::Remove(k) => {
                        prop_assert_eq!(cache.remove(&k), model.remove(&k));
                    }
                    Op::Get(k) => {
                        prop_assert_eq!(cache.get(&k), model.get(&k));
                    }
                }
            }

            prop_assert_eq!(cache.size(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(cache.get(k), Some(v));
            }
            cache.check_invariants().unwrap();
        }
    }
}

// ==============================================
// Structural Invariants Under Churn
// ==============================================

mod churn {
    use super::*;

    // Properties 3, 4 and 5 via check_invariants after seeded random churn.
    #[test]
    fn invariants_hold_through_heavy_churn() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut cache = frozen_clock_cache(16);
        let mut live: Vec<u64> = Vec::new();

        for step in 0..20_000u64 {
            if live.is_empty() || rng.random_range(0..100) < 60 {
                let key = rng.random_range(0..50_000u64);
                cache.put(key, step);
                if !live.contains(&key) {
                    live.push(key);
                }
            } else {
                let index = rng.random_range(0..live.len());
                let key = live.swap_remove(index);
                cache.remove(&key);
            }
            if step % 4_000 == 0 {
                cache.check_invariants().unwrap();
            }
        }
        cache.check_invariants().unwrap();
    }
}
