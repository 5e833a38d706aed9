//! Property-based tests for the store.
//!
//! These tests verify invariants that should hold for all inputs, using
//! differential testing against `BTreeMap` as an oracle. Freeze and trim
//! calls are interleaved at random so the copy-on-write and reclamation
//! machinery is exercised mid-sequence, not just at the end.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use std::collections::BTreeMap;

use proptest::prelude::*;
use snaptree::{Aggregate, MinMax, TreeStore};

/// Small branching factor so splits and merges happen early.
type Store = TreeStore<u64, u64, MinMax<u64>, 4>;

// ============================================================================
//  Strategies
// ============================================================================

/// Operations for random testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Remove(u64),
    Get(u64),
    Freeze,
    Trim,
}

/// Keys from a small domain so inserts and removes actually collide.
fn small_key() -> impl Strategy<Value = u64> {
    0u64..200
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (small_key(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => small_key().prop_map(Op::Remove),
            2 => small_key().prop_map(Op::Get),
            1 => Just(Op::Freeze),
            1 => Just(Op::Trim),
        ],
        0..=max_ops,
    )
}

// ============================================================================
//  Helpers
// ============================================================================

/// Frozen-view contents as a sorted vec.
fn frozen_entries(store: &Store) -> Vec<(u64, u64)> {
    store.frozen_view().iter().collect()
}

fn check_against_oracle(store: &Store, oracle: &BTreeMap<u64, u64>) {
    for (&k, &v) in oracle {
        assert_eq!(store.get(k), Some(v), "oracle mismatch at key {k}");
    }
}

// ============================================================================
//  Differential properties
// ============================================================================

proptest! {
    /// Random op sequences match BTreeMap exactly, entry for entry.
    #[test]
    fn prop_differential_vs_btreemap(ops in operations(400)) {
        let mut store = Store::new();
        let mut oracle: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let expected = oracle.insert(k, v);
                    let got = store.insert(k, v).unwrap();
                    prop_assert_eq!(got, expected);
                }
                Op::Remove(k) => {
                    let expected = oracle.remove(&k);
                    let got = store.remove(k).unwrap();
                    prop_assert_eq!(got, expected);
                }
                Op::Get(k) => {
                    prop_assert_eq!(store.get(k), oracle.get(&k).copied());
                }
                Op::Freeze => store.freeze(),
                Op::Trim => {
                    store.reclaim_memory();
                }
            }
            prop_assert_eq!(store.len(), oracle.len());
        }

        check_against_oracle(&store, &oracle);

        // Final freeze: the snapshot must equal the oracle in order.
        store.freeze();
        let entries = frozen_entries(&store);
        let expected: Vec<(u64, u64)> = oracle.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(entries, expected);
    }

    /// In-order traversal of any frozen view yields strictly increasing keys.
    #[test]
    fn prop_frozen_iteration_strictly_sorted(ops in operations(300)) {
        let mut store = Store::new();
        for op in ops {
            match op {
                Op::Insert(k, v) => { store.insert(k, v).unwrap(); }
                Op::Remove(k) => { store.remove(k).unwrap(); }
                Op::Freeze => store.freeze(),
                Op::Trim => { store.reclaim_memory(); }
                Op::Get(_) => {}
            }

            let view = store.frozen_view();
            let keys: Vec<u64> = view.iter().map(|(k, _)| k).collect();
            for pair in keys.windows(2) {
                prop_assert!(pair[0] < pair[1], "unsorted frozen view: {:?}", keys);
            }
            prop_assert_eq!(keys.len(), view.len());
        }
    }

    /// The root aggregate of a frozen view equals the fold over all values.
    #[test]
    fn prop_aggregate_matches_values(ops in operations(300)) {
        let mut store = Store::new();
        for op in ops {
            match op {
                Op::Insert(k, v) => { store.insert(k, v).unwrap(); }
                Op::Remove(k) => { store.remove(k).unwrap(); }
                _ => {}
            }
        }
        store.freeze();

        let view = store.frozen_view();
        let values: Vec<u64> = view.iter().map(|(_, v)| v).collect();
        let expected = MinMax::of_values(&values);
        prop_assert_eq!(view.aggregate(), expected);
    }

    /// Inserting N distinct keys in any order then iterating yields exactly
    /// those N keys sorted; double-inserts keep the last value.
    #[test]
    fn prop_round_trip(mut keys in prop::collection::vec(any::<u64>(), 1..200)) {
        let mut store = Store::new();
        for &k in &keys {
            store.insert(k, k ^ 0xFF).unwrap();
            store.insert(k, k).unwrap(); // last write wins
        }
        store.freeze();

        keys.sort_unstable();
        keys.dedup();
        let entries = frozen_entries(&store);
        let expected: Vec<(u64, u64)> = keys.iter().map(|&k| (k, k)).collect();
        prop_assert_eq!(entries, expected);
    }

    /// Removing an absent key reports None and leaves the frozen contents
    /// untouched.
    #[test]
    fn prop_remove_absent_is_idempotent(
        present in prop::collection::btree_set(0u64..100, 1..50),
        absent in 100u64..200,
    ) {
        let mut store = Store::new();
        for &k in &present {
            store.insert(k, k).unwrap();
        }
        store.freeze();
        let before = frozen_entries(&store);

        prop_assert_eq!(store.remove(absent).unwrap(), None);
        store.freeze();
        prop_assert_eq!(frozen_entries(&store), before);
    }

    /// seek() lands on the first key >= target, for every target.
    #[test]
    fn prop_seek_matches_oracle(
        keys in prop::collection::btree_set(0u64..500, 0..100),
        target in 0u64..510,
    ) {
        let mut store = Store::new();
        for &k in &keys {
            store.insert(k, k).unwrap();
        }
        store.freeze();

        let view = store.frozen_view();
        let it = view.seek(target);
        let expected = keys.range(target..).next().copied();
        prop_assert_eq!(it.entry().map(|(k, _)| k), expected);
    }
}
