//! # `snaptree`
//!
//! A generation-safe, copy-on-write ordered map (B-tree).
//!
//! One writer thread mutates the structure continuously while an unbounded
//! number of reader threads iterate point-in-time snapshots without taking
//! any lock and without the writer ever blocking on them. The structure is
//! the core underneath an inverted-index dictionary and a distributed
//! bucket database; it is consumed in-process, not exposed over the wire.
//!
//! ## How the pieces fit
//!
//! | Component | Role |
//! |-----------|------|
//! | [`NodeArena`](arena::NodeArena) | slab storage addressed by compact [`NodeRef`]s |
//! | [`GenerationHandler`] | generation counter + registry of live reader guards |
//! | [`NodeAllocator`] | alloc / thaw / hold / freeze / trim orchestration |
//! | [`Tree`] | root handle + split/merge/rebalance mutation algorithm |
//! | [`FrozenView`] / [`FrozenIter`] | lock-free snapshot cursors |
//! | [`TreeStore`] | the combined typed ordered-map API |
//!
//! The writer's commit cycle is mutate, [`freeze`](TreeStore::freeze),
//! [`trim_hold_lists`](TreeStore::trim_hold_lists): mutation copies the
//! root-to-leaf path it touches (copy-on-write "thaw"), freeze publishes the
//! new snapshot and bumps the generation, and trimming reclaims superseded
//! nodes once no live reader guard can still be walking them.
//!
//! ## Example
//!
//! ```rust
//! use snaptree::{MinMax, TreeStore};
//!
//! let mut store: TreeStore<u64, u64, MinMax<u64>> = TreeStore::new();
//! for doc in [7u64, 3, 11] {
//!     store.insert(doc, doc * 100).unwrap();
//! }
//! store.freeze();
//!
//! // Readers clone a handle once and take a view per traversal.
//! let reader = store.reader();
//! let view = reader.frozen_view();
//! assert_eq!(view.iter().map(|(k, _)| k).collect::<Vec<_>>(), vec![3, 7, 11]);
//!
//! // The view survives any amount of later mutation.
//! store.remove(3).unwrap();
//! store.freeze();
//! assert_eq!(view.len(), 3);
//! assert_eq!(view.aggregate().min(), Some(300));
//!
//! drop(view);
//! store.reclaim_memory();
//! ```
//!
//! ## Concurrency contract
//!
//! Exactly one writer per store (enforced by `&mut self`); readers are
//! unbounded and lock-free. A reader's view is the tree as of the most
//! recent freeze at view creation; two concurrent readers may see different
//! snapshots. The writer never waits on readers - at worst it declines to
//! reclaim memory that is still observable.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod aggregate;
pub mod allocator;
pub mod arena;
pub mod frozen;
pub mod generation;
pub mod internode;
pub mod leaf;
pub mod node;
pub mod noderef;
pub mod ordering;
pub mod store;
pub mod tree;

mod tracing_helpers;

use std::fmt as StdFmt;

// Re-export main types for convenience
pub use aggregate::{Aggregate, MinMax, NoAggregate};
pub use allocator::{AllocatorConfig, AllocatorStats, CompactionPlan, NodeAllocator};
pub use arena::AllocError;
pub use frozen::{FrozenIter, FrozenView};
pub use generation::{GenGuard, GenerationHandler};
pub use node::NodeState;
pub use noderef::NodeRef;
pub use store::{StoreReader, TreeStore, DEFAULT_BRANCHING};
pub use tree::Tree;

/// Key requirements: totally ordered plain data.
///
/// Keys are stored inline in fixed-width node arrays, so they must be
/// `Copy`; `Default` fills unoccupied slots.
pub trait TreeKey: Copy + Ord + Default + StdFmt::Debug {}

impl<T: Copy + Ord + Default + StdFmt::Debug> TreeKey for T {}

/// Value requirements: plain data stored inline next to its key.
pub trait TreeValue: Copy + Default + StdFmt::Debug {}

impl<T: Copy + Default + StdFmt::Debug> TreeValue for T {}
