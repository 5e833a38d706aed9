//! The typed ordered-map store.
//!
//! [`TreeStore`] is the externally visible API: an ordered `K -> V` map with
//! single-writer mutation and lock-free frozen-snapshot readers, as consumed
//! by an inverted-index dictionary (word to posting-list location, `MinMax`
//! aggregate over document ids) or a bucket database (bucket id to bucket
//! state, range scans by prefix).
//!
//! The writer owns the store (`&mut self` on every mutating call) and drives
//! the commit cycle:
//!
//! ```text
//! insert / remove ...   -> mutate the working tree (copy-on-write)
//! freeze()              -> publish a new immutable snapshot, bump generation
//! trim_hold_lists(g)    -> reclaim storage no live reader can reach
//! compact()             -> occasionally evacuate fragmented buffers
//! ```
//!
//! Readers obtain a cloneable [`StoreReader`] handle once and then take a
//! [`FrozenView`] per traversal, from any thread, without ever touching the
//! writer half. The generation handler may be shared across stores so a
//! whole subsystem trims against one epoch.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::allocator::{AllocatorConfig, AllocatorStats, NodeAllocator};
use crate::arena::{AllocError, NodeArena};
use crate::frozen::FrozenView;
use crate::generation::GenerationHandler;
use crate::internode::InternalNode;
use crate::leaf::LeafNode;
use crate::noderef::NodeRef;
use crate::ordering::WRITE_ORD;
use crate::tree::Tree;
use crate::{TreeKey, TreeValue};

/// Default branching factor, matching the size of a couple of cache lines
/// for small key types.
pub const DEFAULT_BRANCHING: usize = 16;

// ============================================================================
//  StoreShared
// ============================================================================

/// State shared between the writer and all reader handles: the two node
/// arenas and the published snapshot.
pub(crate) struct StoreShared<K, V, A, const B: usize> {
    pub(crate) leaves: NodeArena<LeafNode<K, V, A, B>>,
    pub(crate) internals: NodeArena<InternalNode<K, A, B>>,
    /// Latest frozen root and entry count, packed into one word so a view
    /// can never pair a root with another snapshot's count.
    /// Release-published by `freeze`, Acquire-loaded by views.
    pub(crate) frozen_snapshot: AtomicU64,
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> StoreShared<K, V, A, B> {
    pub(crate) fn new() -> Self {
        Self {
            leaves: NodeArena::new(),
            internals: NodeArena::new(),
            frozen_snapshot: AtomicU64::new(pack_snapshot(NodeRef::INVALID, 0)),
        }
    }
}

/// Pack a frozen root and its entry count into one atomic word.
pub(crate) fn pack_snapshot(root: NodeRef, len: usize) -> u64 {
    debug_assert!(len <= u32::MAX as usize, "snapshot length exceeds u32");
    (len as u64) << 32 | u64::from(root.raw())
}

/// Inverse of [`pack_snapshot`].
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn unpack_snapshot(raw: u64) -> (NodeRef, usize) {
    (NodeRef::from_raw(raw as u32), (raw >> 32) as usize)
}

// ============================================================================
//  TreeStore
// ============================================================================

/// Ordered `K -> V` map with copy-on-write snapshots.
///
/// Exactly one writer may exist per store; the type enforces it by taking
/// `&mut self` on every mutating operation. Unbounded readers run in
/// parallel through [`StoreReader`] handles.
///
/// # Example
///
/// ```rust
/// use snaptree::{MinMax, TreeStore};
///
/// let mut store: TreeStore<u64, u64, MinMax<u64>> = TreeStore::new();
/// store.insert(10, 100).unwrap();
/// store.insert(20, 200).unwrap();
/// store.freeze();
///
/// let reader = store.reader();
/// let view = reader.frozen_view();
/// assert_eq!(view.get(10), Some(100));
/// assert_eq!(view.aggregate().max(), Some(200));
/// assert_eq!(view.iter().count(), 2);
/// ```
pub struct TreeStore<K, V, A = crate::aggregate::NoAggregate, const B: usize = DEFAULT_BRANCHING> {
    shared: Arc<StoreShared<K, V, A, B>>,
    handler: Arc<GenerationHandler>,
    allocator: NodeAllocator<K, V, A, B>,
    tree: Tree<K, V, A, B>,
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> TreeStore<K, V, A, B> {
    /// Create an empty store with default configuration and its own
    /// generation handler.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(AllocatorConfig::default(), Arc::new(GenerationHandler::new()))
    }

    /// Create an empty store with the given allocator configuration.
    #[must_use]
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self::with_parts(config, Arc::new(GenerationHandler::new()))
    }

    /// Create an empty store sharing `handler` with other structures, so
    /// one epoch covers them all.
    #[must_use]
    pub fn with_generation_handler(handler: Arc<GenerationHandler>) -> Self {
        Self::with_parts(AllocatorConfig::default(), handler)
    }

    /// Create an empty store from explicit configuration and handler.
    #[must_use]
    pub fn with_parts(config: AllocatorConfig, handler: Arc<GenerationHandler>) -> Self {
        let shared = Arc::new(StoreShared::new());
        Self {
            allocator: NodeAllocator::new(Arc::clone(&shared), config),
            tree: Tree::new(),
            shared,
            handler,
        }
    }

    // ========================================================================
    //  Writer operations
    // ========================================================================

    /// Insert `key -> value`, returning the previous value if overwritten.
    ///
    /// # Errors
    /// [`AllocError`] if node storage cannot be grown.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, AllocError> {
        self.tree.insert(&mut self.allocator, key, value)
    }

    /// Remove `key`, returning its value, or `None` (an ordinary outcome)
    /// if absent.
    ///
    /// # Errors
    /// [`AllocError`] if copy-on-write fails.
    pub fn remove(&mut self, key: K) -> Result<Option<V>, AllocError> {
        self.tree.remove(&mut self.allocator, key)
    }

    /// Look up `key` in the writer's working view, which includes mutations
    /// not yet frozen.
    #[must_use]
    pub fn get(&self, key: K) -> Option<V> {
        self.tree.get(&self.allocator, key)
    }

    /// Entry count of the working tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the working tree is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Height of the working tree (0 when empty).
    #[must_use]
    pub fn height(&self) -> usize {
        self.tree.height()
    }

    // ========================================================================
    //  Commit cycle
    // ========================================================================

    /// Publish the working tree as the new frozen snapshot.
    ///
    /// Flips every node touched since the last freeze to frozen, publishes
    /// the root, stamps pending retirements with the outgoing generation and
    /// bumps the handler. Readers taking views from now on see the new
    /// snapshot; views already alive keep their old one for as long as they
    /// live.
    pub fn freeze(&mut self) {
        self.allocator.freeze();
        self.shared
            .frozen_snapshot
            .store(pack_snapshot(self.tree.root(), self.tree.len()), WRITE_ORD);
        let outgoing = self.handler.current_generation();
        self.allocator.transfer_hold_lists(outgoing);
        self.handler.bump();
    }

    /// Reclaim every retired node stamped with a generation strictly below
    /// `used_generation`; returns how many nodes were reclaimed.
    ///
    /// # Panics
    /// Debug-asserts `used_generation <= oldest_observed_generation()`;
    /// trimming past a live reader is use-after-reclaim.
    pub fn trim_hold_lists(&mut self, used_generation: u64) -> usize {
        debug_assert!(
            used_generation <= self.handler.oldest_observed_generation(),
            "trimming a generation still observed by a live guard"
        );
        self.allocator.trim_hold_lists(used_generation)
    }

    /// Reclaim everything no live reader can reach: trims at the oldest
    /// observed generation.
    pub fn reclaim_memory(&mut self) -> usize {
        let used = self.handler.oldest_observed_generation();
        self.allocator.trim_hold_lists(used)
    }

    /// Evacuate fragmented buffers, if occupancy heuristics select any.
    /// Returns whether a compaction ran. The moved nodes flow through the
    /// normal freeze/hold cycle, so follow up with [`freeze`](Self::freeze)
    /// and trimming as usual.
    ///
    /// # Errors
    /// [`AllocError`] if destination storage cannot be allocated.
    pub fn compact(&mut self) -> Result<bool, AllocError> {
        let plan = self.allocator.start_compact();
        if plan.is_empty() {
            return Ok(false);
        }
        self.tree.compact(&mut self.allocator, &plan)?;
        self.allocator.finish_compact(plan);
        Ok(true)
    }

    // ========================================================================
    //  Reader access
    // ========================================================================

    /// A cloneable, thread-safe reader handle for this store.
    #[must_use]
    pub fn reader(&self) -> StoreReader<K, V, A, B> {
        StoreReader {
            shared: Arc::clone(&self.shared),
            handler: Arc::clone(&self.handler),
        }
    }

    /// A frozen view taken directly by the writer thread (e.g. to verify a
    /// snapshot it just published).
    #[must_use]
    pub fn frozen_view(&self) -> FrozenView<'_, K, V, A, B> {
        FrozenView::new(&self.shared, &self.handler)
    }

    // ========================================================================
    //  Introspection
    // ========================================================================

    /// The generation handler driving this store's reclamation.
    #[must_use]
    pub fn generation_handler(&self) -> &Arc<GenerationHandler> {
        &self.handler
    }

    /// Allocator occupancy counters.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> Default for TreeStore<K, V, A, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> std::fmt::Debug
    for TreeStore<K, V, A, B>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeStore")
            .field("len", &self.len())
            .field("height", &self.height())
            .field("generation", &self.handler.current_generation())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
//  StoreReader
// ============================================================================

/// Cheap, cloneable handle for reader threads.
///
/// Carries no reference to the writer half; any number of clones may take
/// [`FrozenView`]s concurrently with ongoing writer mutation.
pub struct StoreReader<K, V, A, const B: usize = DEFAULT_BRANCHING> {
    shared: Arc<StoreShared<K, V, A, B>>,
    handler: Arc<GenerationHandler>,
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> StoreReader<K, V, A, B> {
    /// Take a view of the latest frozen snapshot.
    #[must_use]
    pub fn frozen_view(&self) -> FrozenView<'_, K, V, A, B> {
        FrozenView::new(&self.shared, &self.handler)
    }
}

impl<K, V, A, const B: usize> Clone for StoreReader<K, V, A, B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> std::fmt::Debug
    for StoreReader<K, V, A, B>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreReader")
            .field("generation", &self.handler.current_generation())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::MinMax;

    type Store = TreeStore<u64, u64, MinMax<u64>, 4>;

    #[test]
    fn test_empty_store() {
        let store = Store::new();
        assert!(store.is_empty());
        assert_eq!(store.get(1), None);

        let view = store.frozen_view();
        assert!(view.is_empty());
        assert_eq!(view.iter().count(), 0);
        assert!(!view.seek(0).valid());
    }

    #[test]
    fn test_working_view_vs_frozen_view() {
        let mut store = Store::new();
        store.insert(1, 10).unwrap();

        // Not yet frozen: the writer sees it, snapshots do not.
        assert_eq!(store.get(1), Some(10));
        assert_eq!(store.frozen_view().get(1), None);

        store.freeze();
        assert_eq!(store.frozen_view().get(1), Some(10));
    }

    #[test]
    fn test_snapshot_stability_across_mutation() {
        let mut store = Store::new();
        for k in 1..=20u64 {
            store.insert(k, k).unwrap();
        }
        store.freeze();

        let reader = store.reader();
        let view = reader.frozen_view();

        for k in 1..=10u64 {
            store.remove(k).unwrap();
        }
        store.insert(999, 999).unwrap();
        store.freeze();
        store.reclaim_memory();

        // The old view still sees exactly the first snapshot.
        let keys: Vec<u64> = view.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (1..=20).collect::<Vec<u64>>());
        assert_eq!(view.len(), 20);

        // A fresh view sees the second snapshot.
        let fresh = reader.frozen_view();
        let keys: Vec<u64> = fresh.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (11..=20).chain(std::iter::once(999)).collect::<Vec<u64>>());
    }

    #[test]
    fn test_seek_and_cursor() {
        let mut store = Store::new();
        for k in (2..=40u64).step_by(2) {
            store.insert(k, k * 10).unwrap();
        }
        store.freeze();

        let view = store.frozen_view();
        let mut it = view.seek(25);
        assert!(it.valid());
        assert_eq!(it.key(), 26);
        assert_eq!(it.value(), 260);

        it.advance();
        assert_eq!(it.key(), 28);

        it.seek(40);
        assert_eq!(it.key(), 40);
        it.advance();
        assert!(!it.valid());

        assert!(!view.seek(41).valid());
    }

    #[test]
    fn test_reclaim_frees_superseded_nodes() {
        let mut store = Store::new();
        for k in 1..=100u64 {
            store.insert(k, k).unwrap();
        }
        store.freeze();

        // Overwrite a value: the whole path to its leaf is re-copied.
        store.insert(50, 5000).unwrap();
        store.freeze();

        assert!(store.stats().held_nodes > 0);
        let reclaimed = store.reclaim_memory();
        assert!(reclaimed > 0);
        assert_eq!(store.stats().held_nodes, 0);
    }

    #[test]
    fn test_reclaim_blocked_by_live_view() {
        let mut store = Store::new();
        for k in 1..=50u64 {
            store.insert(k, k).unwrap();
        }
        store.freeze();

        let reader = store.reader();
        let view = reader.frozen_view();

        store.remove(25).unwrap();
        store.freeze();

        // The view pins its generation: nothing can be reclaimed yet.
        assert_eq!(store.reclaim_memory(), 0);
        let held = store.stats().held_nodes;
        assert!(held > 0);

        drop(view);
        assert!(store.reclaim_memory() >= held);
        assert_eq!(store.stats().held_nodes, 0);
    }

    #[test]
    fn test_shared_generation_handler() {
        let handler = Arc::new(GenerationHandler::new());
        let mut a: Store = TreeStore::with_generation_handler(Arc::clone(&handler));
        let mut b: Store = TreeStore::with_generation_handler(Arc::clone(&handler));

        a.insert(1, 1).unwrap();
        b.insert(2, 2).unwrap();
        a.freeze();
        b.freeze();
        assert_eq!(handler.current_generation(), 2);

        // A guard on the shared epoch blocks both stores' trims.
        let reader_a = a.reader();
        let view = reader_a.frozen_view();
        a.insert(1, 11).unwrap();
        a.freeze();
        assert_eq!(a.reclaim_memory(), 0);
        drop(view);
        assert!(a.reclaim_memory() > 0);
    }

    #[test]
    fn test_compact_roundtrip() {
        let config = AllocatorConfig::default()
            .with_initial_buffer_capacity(8)
            .with_compaction_dead_ratio_percent(20);
        let mut store = Store::with_config(config);
        for k in 1..=200u64 {
            store.insert(k, k).unwrap();
        }
        store.freeze();
        for k in 1..=150u64 {
            store.remove(k).unwrap();
        }
        store.freeze();
        store.reclaim_memory();

        let ran = store.compact().unwrap();
        assert!(ran);
        store.freeze();
        let buffers_before = store.stats().buffers;
        store.reclaim_memory();
        assert!(store.stats().buffers < buffers_before);

        let view = store.frozen_view();
        let keys: Vec<u64> = view.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (151..=200).collect::<Vec<u64>>());
    }
}
