//! Benchmarks for `TreeStore` using Divan.
//!
//! Run with: `cargo bench --bench tree`
#![allow(clippy::cast_possible_truncation)]

use divan::{black_box, Bencher};
use snaptree::{MinMax, NoAggregate, TreeStore};

fn main() {
    divan::main();
}

const SIZES: [u64; 2] = [1_000, 100_000];

// =============================================================================
// Insert Operations
// =============================================================================

#[divan::bench_group]
mod insert {
    use super::{black_box, Bencher, NoAggregate, TreeStore, SIZES};

    #[divan::bench(args = SIZES)]
    fn sequential(bencher: Bencher, n: u64) {
        bencher.bench(|| {
            let mut store: TreeStore<u64, u64, NoAggregate> = TreeStore::new();
            for k in 0..n {
                store.insert(k, k).unwrap();
            }
            black_box(store.len())
        });
    }

    #[divan::bench(args = SIZES)]
    fn shuffled(bencher: Bencher, n: u64) {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut keys: Vec<u64> = (0..n).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(0x5EED));
        bencher.bench(|| {
            let mut store: TreeStore<u64, u64, NoAggregate> = TreeStore::new();
            for (i, &k) in keys.iter().enumerate() {
                store.insert(k, i as u64).unwrap();
            }
            black_box(store.len())
        });
    }
}

// =============================================================================
// Lookup Operations
// =============================================================================

#[divan::bench_group]
mod lookup {
    use super::{black_box, Bencher, NoAggregate, TreeStore, SIZES};

    #[divan::bench(args = SIZES)]
    fn working_view(bencher: Bencher, n: u64) {
        let mut store: TreeStore<u64, u64, NoAggregate> = TreeStore::new();
        for k in 0..n {
            store.insert(k, k).unwrap();
        }
        bencher.bench(|| {
            let mut found = 0u64;
            for k in 0..n {
                if store.get(black_box(k)).is_some() {
                    found += 1;
                }
            }
            found
        });
    }

    #[divan::bench(args = SIZES)]
    fn frozen_view(bencher: Bencher, n: u64) {
        let mut store: TreeStore<u64, u64, NoAggregate> = TreeStore::new();
        for k in 0..n {
            store.insert(k, k).unwrap();
        }
        store.freeze();
        let reader = store.reader();
        bencher.bench(|| {
            let view = reader.frozen_view();
            let mut found = 0u64;
            for k in 0..n {
                if view.get(black_box(k)).is_some() {
                    found += 1;
                }
            }
            found
        });
    }
}

// =============================================================================
// Scans
// =============================================================================

#[divan::bench_group]
mod scan {
    use super::{black_box, Bencher, MinMax, TreeStore, SIZES};

    #[divan::bench(args = SIZES)]
    fn full_frozen_scan(bencher: Bencher, n: u64) {
        let mut store: TreeStore<u64, u64, MinMax<u64>> = TreeStore::new();
        for k in 0..n {
            store.insert(k, k).unwrap();
        }
        store.freeze();
        let reader = store.reader();
        bencher.bench(|| {
            let view = reader.frozen_view();
            black_box(view.iter().count())
        });
    }

    #[divan::bench(args = SIZES)]
    fn seek_and_scan_100(bencher: Bencher, n: u64) {
        let mut store: TreeStore<u64, u64, MinMax<u64>> = TreeStore::new();
        for k in 0..n {
            store.insert(k, k).unwrap();
        }
        store.freeze();
        let reader = store.reader();
        bencher.bench(|| {
            let view = reader.frozen_view();
            black_box(view.seek(n / 2).take(100).count())
        });
    }
}

// =============================================================================
// Commit Cycle
// =============================================================================

#[divan::bench_group]
mod commit {
    use super::{black_box, Bencher, NoAggregate, TreeStore};

    /// One full cycle: a small batch of updates, freeze, trim.
    #[divan::bench]
    fn update_freeze_trim(bencher: Bencher) {
        let mut store: TreeStore<u64, u64, NoAggregate> = TreeStore::new();
        for k in 0..100_000u64 {
            store.insert(k, k).unwrap();
        }
        store.freeze();
        store.reclaim_memory();

        let mut next = 0u64;
        bencher.bench_local(move || {
            for _ in 0..64 {
                next = (next + 9973) % 100_000;
                store.insert(next, next).unwrap();
            }
            store.freeze();
            black_box(store.reclaim_memory())
        });
    }
}
