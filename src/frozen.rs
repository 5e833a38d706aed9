//! Frozen snapshot views and iteration.
//!
//! A [`FrozenView`] binds a generation guard to the most recently published
//! frozen root: the guard is taken first, then the root is acquire-loaded,
//! so every node reachable from it is protected until the view drops. The
//! view and its [`FrozenIter`] cursors read only frozen state and take no
//! locks; they interleave arbitrarily with writer mutation on the same
//! logical tree because the writer never edits a frozen node in place.
//!
//! Two views taken at different times may observe different snapshots; one
//! view's iteration is immune to any number of later mutations, freezes and
//! trims for as long as it lives. Dropping a view or cursor early is always
//! safe.

use smallvec::SmallVec;

use crate::aggregate::Aggregate;
use crate::generation::{GenGuard, GenerationHandler};
use crate::internode::InternalNode;
use crate::leaf::LeafNode;
use crate::node::NodeState;
use crate::noderef::NodeRef;
use crate::ordering::READ_ORD;
use crate::store::{unpack_snapshot, StoreShared};
use crate::tree::{lookup_in, MAX_EXPECTED_HEIGHT};
use crate::{TreeKey, TreeValue};

// ============================================================================
//  FrozenView
// ============================================================================

/// A point-in-time, lock-free view of the tree as of the latest `freeze()`.
///
/// Holding the view pins its generation: nothing it can reach will be
/// reclaimed until it is dropped.
pub struct FrozenView<'a, K, V, A, const B: usize> {
    shared: &'a StoreShared<K, V, A, B>,
    guard: GenGuard<'a>,
    root: NodeRef,
    len: usize,
}

impl<'a, K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> FrozenView<'a, K, V, A, B> {
    /// Guard first, then root: a root loaded under the guard can only be
    /// reclaimed after the guard is released.
    pub(crate) fn new(shared: &'a StoreShared<K, V, A, B>, handler: &'a GenerationHandler) -> Self {
        let guard = handler.take_guard();
        let (root, len) = unpack_snapshot(shared.frozen_snapshot.load(READ_ORD));
        Self {
            shared,
            guard,
            root,
            len,
        }
    }

    /// Entry count of this snapshot.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the snapshot holds no entries.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The generation this view pins.
    #[must_use]
    #[inline]
    pub fn generation(&self) -> u64 {
        self.guard.generation()
    }

    /// Root of the snapshot (invalid for an empty snapshot).
    #[must_use]
    #[inline]
    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// Look up `key` in the snapshot.
    #[must_use]
    pub fn get(&self, key: K) -> Option<V> {
        lookup_in(self.shared, self.root, key)
    }

    /// Whether `key` exists in the snapshot.
    #[must_use]
    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Aggregate over every value in the snapshot (e.g. min/max document id
    /// for skip-ahead search); the empty aggregate for an empty snapshot.
    #[must_use]
    pub fn aggregate(&self) -> A {
        if !self.root.valid() {
            return A::default();
        }
        if self.root.is_leaf() {
            self.leaf(self.root).aggregate()
        } else {
            self.internal(self.root).aggregate()
        }
    }

    /// Cursor positioned at the smallest key.
    #[must_use]
    pub fn iter(&self) -> FrozenIter<'_, K, V, A, B> {
        let mut it = FrozenIter::unpositioned(self);
        if self.root.valid() {
            it.descend_first(self.root);
        }
        it
    }

    /// Cursor positioned at the first key `>= key` (invalid if none).
    #[must_use]
    pub fn seek(&self, key: K) -> FrozenIter<'_, K, V, A, B> {
        let mut it = FrozenIter::unpositioned(self);
        it.seek(key);
        it
    }

    pub(crate) fn leaf(&self, r: NodeRef) -> &LeafNode<K, V, A, B> {
        debug_assert!(r.valid() && r.is_leaf());
        let leaf = self.shared.leaves.resolve(r.buffer_id(), r.offset());
        debug_assert!(
            matches!(leaf.state().load(), NodeState::Frozen | NodeState::Held),
            "frozen traversal reached a {:?} leaf",
            leaf.state().load()
        );
        leaf
    }

    pub(crate) fn internal(&self, r: NodeRef) -> &InternalNode<K, A, B> {
        debug_assert!(r.valid() && !r.is_leaf());
        let node = self.shared.internals.resolve(r.buffer_id(), r.offset());
        debug_assert!(
            matches!(node.state().load(), NodeState::Frozen | NodeState::Held),
            "frozen traversal reached a {:?} internal node",
            node.state().load()
        );
        node
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> std::fmt::Debug
    for FrozenView<'_, K, V, A, B>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenView")
            .field("generation", &self.generation())
            .field("root", &self.root)
            .field("len", &self.len)
            .finish()
    }
}

// ============================================================================
//  FrozenIter
// ============================================================================

/// Lock-free cursor over one frozen snapshot, in ascending key order.
///
/// Offers both a cursor interface ([`valid`](Self::valid),
/// [`key`](Self::key), [`value`](Self::value), [`advance`](Self::advance),
/// [`seek`](Self::seek)) and a standard [`Iterator`] over `(K, V)` pairs.
pub struct FrozenIter<'a, K, V, A, const B: usize> {
    view: &'a FrozenView<'a, K, V, A, B>,
    /// Internal-node ancestry: (node, child index on the current path).
    path: SmallVec<[(NodeRef, usize); MAX_EXPECTED_HEIGHT]>,
    /// Current leaf, or invalid when exhausted.
    leaf: NodeRef,
    pos: usize,
}

impl<'a, K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> FrozenIter<'a, K, V, A, B> {
    fn unpositioned(view: &'a FrozenView<'a, K, V, A, B>) -> Self {
        Self {
            view,
            path: SmallVec::new(),
            leaf: NodeRef::INVALID,
            pos: 0,
        }
    }

    /// Whether the cursor points at an entry.
    #[must_use]
    #[inline]
    pub fn valid(&self) -> bool {
        self.leaf.valid()
    }

    /// Key at the cursor.
    ///
    /// # Panics
    /// Debug-asserts the cursor is valid.
    #[must_use]
    #[inline]
    pub fn key(&self) -> K {
        debug_assert!(self.valid());
        self.view.leaf(self.leaf).key_at(self.pos)
    }

    /// Value at the cursor.
    ///
    /// # Panics
    /// Debug-asserts the cursor is valid.
    #[must_use]
    #[inline]
    pub fn value(&self) -> V {
        debug_assert!(self.valid());
        self.view.leaf(self.leaf).value_at(self.pos)
    }

    /// Current entry, or `None` when exhausted.
    #[must_use]
    pub fn entry(&self) -> Option<(K, V)> {
        self.valid().then(|| (self.key(), self.value()))
    }

    /// Aggregate of the snapshot this cursor walks.
    #[must_use]
    pub fn aggregate(&self) -> A {
        self.view.aggregate()
    }

    /// Step to the next entry in key order.
    pub fn advance(&mut self) {
        debug_assert!(self.valid(), "advance of an exhausted cursor");
        self.pos += 1;
        if self.pos >= self.view.leaf(self.leaf).len() {
            self.climb();
        }
    }

    /// Reposition at the first entry with key `>= key`, or exhaust the
    /// cursor if there is none.
    pub fn seek(&mut self, key: K) {
        let view = self.view;
        self.path.clear();
        self.leaf = NodeRef::INVALID;
        self.pos = 0;

        if !view.root().valid() {
            return;
        }
        let mut node = view.root();
        while !node.is_leaf() {
            let inner = view.internal(node);
            let idx = inner.lower_bound(key);
            if idx == inner.len() {
                // Separators are subtree maxima: key is beyond the tree.
                return;
            }
            self.path.push((node, idx));
            node = inner.child_at(idx);
        }
        self.leaf = node;
        self.pos = match view.leaf(node).search(key) {
            Ok(idx) | Err(idx) => idx,
        };
        if self.pos >= view.leaf(node).len() {
            self.climb();
        }
    }

    /// Descend to the leftmost leaf under `node`.
    fn descend_first(&mut self, mut node: NodeRef) {
        let view = self.view;
        while !node.is_leaf() {
            self.path.push((node, 0));
            node = view.internal(node).child_at(0);
        }
        self.leaf = node;
        self.pos = 0;
    }

    /// The current leaf is exhausted: move to the next leaf in order, or
    /// exhaust the cursor.
    fn climb(&mut self) {
        let view = self.view;
        while let Some(top) = self.path.last_mut() {
            let next = top.1 + 1;
            if next < view.internal(top.0).len() {
                top.1 = next;
                let child = view.internal(top.0).child_at(next);
                self.descend_first(child);
                return;
            }
            self.path.pop();
        }
        self.leaf = NodeRef::INVALID;
        self.pos = 0;
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> Iterator
    for FrozenIter<'_, K, V, A, B>
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let item = self.entry()?;
        self.advance();
        Some(item)
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> std::fmt::Debug
    for FrozenIter<'_, K, V, A, B>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenIter")
            .field("valid", &self.valid())
            .field("depth", &self.path.len())
            .finish_non_exhaustive()
    }
}
