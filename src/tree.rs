//! Filepath: src/tree.rs
//!
//! Tree root and the single-writer mutation algorithm.
//!
//! A [`Tree`] is little more than a root [`NodeRef`] plus height and entry
//! count; all node storage lives in the allocator's arenas. The mutation
//! algorithm is a classic B-tree descent with one twist: every node on the
//! root-to-leaf path of a mutation is thawed (copied on write) before it is
//! edited, so nodes off the path stay shared with the previous frozen
//! snapshot and in-flight readers never observe a half-mutated node.
//!
//! - Inserting into a full node splits it at the median and pushes the new
//!   separator into the (already thawed) parent; a root split grows the tree
//!   by one level.
//! - Removing below half occupancy merges with a sibling or redistributes
//!   entries from it; a root reduced to a single child shrinks the tree by
//!   one level.
//! - Separator keys are per-child subtree maxima, refreshed on the way back
//!   up, and each node's cached aggregate is refolded bottom-up after every
//!   edit.
//!
//! Duplicate inserts overwrite in place on the thawed copy; removing an
//! absent key reports `None` and leaves the tree structurally untouched.

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::aggregate::Aggregate;
use crate::allocator::{CompactionPlan, NodeAllocator};
use crate::arena::AllocError;
use crate::noderef::NodeRef;
use crate::store::StoreShared;
use crate::{TreeKey, TreeValue};

/// Inline capacity for recursion-free walks; trees deeper than this spill to
/// the heap, which in practice never happens (B >= 4 and 2^21 slots per
/// buffer bound the height well below 16).
pub(crate) const MAX_EXPECTED_HEIGHT: usize = 16;

// ============================================================================
//  Tree
// ============================================================================

/// Root handle of one copy-on-write B-tree.
///
/// All methods taking `&mut NodeAllocator` are writer-side; the reader-side
/// view of the same logical tree is a
/// [`FrozenView`](crate::frozen::FrozenView) obtained from the store.
pub struct Tree<K, V, A, const B: usize> {
    root: NodeRef,
    height: u8,
    len: usize,
    _marker: PhantomData<(K, V, A)>,
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> Tree<K, V, A, B> {
    /// Create an empty tree.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            root: NodeRef::INVALID,
            height: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Current working root (may reference mutable nodes).
    #[must_use]
    #[inline]
    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// Number of levels, 0 for an empty tree.
    #[must_use]
    #[inline]
    pub fn height(&self) -> usize {
        usize::from(self.height)
    }

    /// Number of entries.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no entries.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up `key` in the working tree (the writer's own, possibly not yet
    /// frozen, view).
    #[must_use]
    pub fn get(&self, alloc: &NodeAllocator<K, V, A, B>, key: K) -> Option<V> {
        lookup_in(alloc.shared(), self.root, key)
    }

    /// Insert `key -> value`, returning the previous value if the key was
    /// already present (overwritten in place, no structural change).
    ///
    /// # Errors
    /// [`AllocError`] if copy-on-write or node allocation fails; the tree is
    /// left unchanged in that case.
    pub fn insert(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A, B>,
        key: K,
        value: V,
    ) -> Result<Option<V>, AllocError> {
        if !self.root.valid() {
            let r = alloc.alloc_leaf()?;
            let leaf = alloc.leaf_mut(r);
            leaf.insert_at(0, key, value);
            leaf.recompute_aggregate();
            self.root = r;
            self.height = 1;
            self.len = 1;
            return Ok(None);
        }

        let (new_root, old, split) = insert_rec(alloc, self.root, key, value)?;
        self.root = new_root;

        if let Some(right) = split {
            let level = self.height; // one above the old root
            let grown = alloc.alloc_internal(level)?;
            let left_max = node_max_key(alloc, self.root);
            let right_max = node_max_key(alloc, right);
            {
                let node = alloc.internal_mut(grown);
                node.insert_child_at(0, left_max, self.root);
                node.insert_child_at(1, right_max, right);
            }
            refresh_internal_aggregate(alloc, grown);
            self.root = grown;
            self.height += 1;
        }

        if old.is_none() {
            self.len += 1;
        }
        Ok(old)
    }

    /// Remove `key`, returning its value or `None` if absent. An absent key
    /// is an ordinary outcome, not an error, and leaves the tree untouched.
    ///
    /// # Errors
    /// [`AllocError`] if copy-on-write fails.
    pub fn remove(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A, B>,
        key: K,
    ) -> Result<Option<V>, AllocError> {
        if !self.root.valid() || self.get(alloc, key).is_none() {
            return Ok(None);
        }

        let (new_root, removed, _underflow) = remove_rec(alloc, self.root, key)?;
        debug_assert!(removed.is_some(), "pre-checked key vanished during descent");
        self.root = new_root;
        if removed.is_some() {
            self.len -= 1;
        }
        self.collapse_root(alloc);
        Ok(removed)
    }

    /// Move every live node out of the buffers selected by `plan`,
    /// rewriting parent links through the ordinary thaw path.
    ///
    /// # Errors
    /// [`AllocError`] if a destination slot cannot be allocated.
    pub fn compact(
        &mut self,
        alloc: &mut NodeAllocator<K, V, A, B>,
        plan: &CompactionPlan,
    ) -> Result<(), AllocError> {
        if !self.root.valid() || plan.is_empty() {
            return Ok(());
        }
        if let Some(new_root) = compact_rec(alloc, plan, self.root)? {
            self.root = new_root;
        }
        Ok(())
    }

    /// Shrink the tree while the root is trivial: an empty leaf root makes
    /// the tree empty, an internal root with one child drops a level.
    fn collapse_root(&mut self, alloc: &mut NodeAllocator<K, V, A, B>) {
        loop {
            if !self.root.valid() {
                self.height = 0;
                return;
            }
            if self.root.is_leaf() {
                if alloc.leaf(self.root).is_empty() {
                    alloc.hold(self.root);
                    self.root = NodeRef::INVALID;
                    self.height = 0;
                }
                return;
            }
            let only_child = {
                let node = alloc.internal(self.root);
                (node.len() == 1).then(|| node.child_at(0))
            };
            match only_child {
                Some(child) => {
                    alloc.hold(self.root);
                    self.root = child;
                    self.height -= 1;
                }
                None => return,
            }
        }
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> std::fmt::Debug
    for Tree<K, V, A, B>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root)
            .field("height", &self.height)
            .field("len", &self.len)
            .finish()
    }
}

// ============================================================================
//  Lookup
// ============================================================================

/// Walk from `root` to the leaf covering `key`. Shared by the writer's
/// working view and the frozen reader view; pure reads.
pub(crate) fn lookup_in<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    shared: &StoreShared<K, V, A, B>,
    root: NodeRef,
    key: K,
) -> Option<V> {
    if !root.valid() {
        return None;
    }
    let mut node = root;
    loop {
        if node.is_leaf() {
            let leaf = shared.leaves.resolve(node.buffer_id(), node.offset());
            return leaf.search(key).ok().map(|idx| leaf.value_at(idx));
        }
        let inner = shared.internals.resolve(node.buffer_id(), node.offset());
        let idx = inner.lower_bound(key);
        if idx == inner.len() {
            return None;
        }
        node = inner.child_at(idx);
    }
}

// ============================================================================
//  Insert
// ============================================================================

/// Recursive insert step: returns the (possibly re-allocated) subtree root,
/// the overwritten value if any, and a new right sibling if this node split.
fn insert_rec<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    alloc: &mut NodeAllocator<K, V, A, B>,
    node: NodeRef,
    key: K,
    value: V,
) -> Result<(NodeRef, Option<V>, Option<NodeRef>), AllocError> {
    if node.is_leaf() {
        return insert_leaf(alloc, node, key, value);
    }

    let node = alloc.thaw_internal(node)?;
    let (idx, child) = {
        let inner = alloc.internal(node);
        let idx = inner.insert_child_index(key);
        (idx, inner.child_at(idx))
    };

    let (new_child, old, child_split) = insert_rec(alloc, child, key, value)?;
    let child_max = node_max_key(alloc, new_child);
    {
        let inner = alloc.internal_mut(node);
        inner.set_child(idx, new_child);
        inner.set_key(idx, child_max);
    }

    let mut right_sibling = None;
    if let Some(split_right) = child_split {
        let separator = node_max_key(alloc, split_right);
        let insert_pos = idx + 1;
        if alloc.internal(node).len() < B {
            alloc
                .internal_mut(node)
                .insert_child_at(insert_pos, separator, split_right);
        } else {
            let level = alloc.internal(node).level();
            let right = alloc.alloc_internal(level)?;
            {
                let (left, right) = alloc.internal_pair_mut(node, right);
                left.split_into(right);
            }
            let half = B / 2;
            if insert_pos <= half {
                alloc
                    .internal_mut(node)
                    .insert_child_at(insert_pos, separator, split_right);
            } else {
                alloc
                    .internal_mut(right)
                    .insert_child_at(insert_pos - half, separator, split_right);
            }
            refresh_internal_aggregate(alloc, right);
            right_sibling = Some(right);
        }
    }

    refresh_internal_aggregate(alloc, node);
    Ok((node, old, right_sibling))
}

fn insert_leaf<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    alloc: &mut NodeAllocator<K, V, A, B>,
    node: NodeRef,
    key: K,
    value: V,
) -> Result<(NodeRef, Option<V>, Option<NodeRef>), AllocError> {
    let node = alloc.thaw_leaf(node)?;
    match alloc.leaf(node).search(key) {
        Ok(idx) => {
            let leaf = alloc.leaf_mut(node);
            let old = leaf.update_value(idx, value);
            leaf.recompute_aggregate();
            Ok((node, Some(old), None))
        }
        Err(idx) if alloc.leaf(node).len() < B => {
            let leaf = alloc.leaf_mut(node);
            leaf.insert_at(idx, key, value);
            leaf.recompute_aggregate();
            Ok((node, None, None))
        }
        Err(idx) => {
            let right = alloc.alloc_leaf()?;
            {
                let (left, right) = alloc.leaf_pair_mut(node, right);
                left.split_into(right);
            }
            let half = B / 2;
            let (target, pos) = if idx <= half {
                (node, idx)
            } else {
                (right, idx - half)
            };
            let leaf = alloc.leaf_mut(target);
            leaf.insert_at(pos, key, value);
            leaf.recompute_aggregate();
            Ok((node, None, Some(right)))
        }
    }
}

// ============================================================================
//  Remove
// ============================================================================

/// Recursive remove step: returns the (possibly re-allocated) subtree root,
/// the removed value if the key was present, and whether this node is now
/// below minimum occupancy.
fn remove_rec<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    alloc: &mut NodeAllocator<K, V, A, B>,
    node: NodeRef,
    key: K,
) -> Result<(NodeRef, Option<V>, bool), AllocError> {
    if node.is_leaf() {
        let node = alloc.thaw_leaf(node)?;
        let leaf = alloc.leaf_mut(node);
        return Ok(match leaf.search(key) {
            Ok(idx) => {
                let (_, value) = leaf.remove_at(idx);
                leaf.recompute_aggregate();
                let underflow = leaf.is_underfull();
                (node, Some(value), underflow)
            }
            Err(_) => (node, None, false),
        });
    }

    let node = alloc.thaw_internal(node)?;
    let (idx, child, len) = {
        let inner = alloc.internal(node);
        let idx = inner.lower_bound(key);
        if idx == inner.len() {
            return Ok((node, None, false));
        }
        (idx, inner.child_at(idx), inner.len())
    };

    let (new_child, removed, child_underflow) = remove_rec(alloc, child, key)?;
    let child_max = node_max_key(alloc, new_child);
    {
        let inner = alloc.internal_mut(node);
        inner.set_child(idx, new_child);
        inner.set_key(idx, child_max);
    }

    if removed.is_none() {
        return Ok((node, None, false));
    }

    if child_underflow && len >= 2 {
        rebalance_child(alloc, node, idx)?;
    }
    refresh_internal_aggregate(alloc, node);
    let underflow = alloc.internal(node).is_underfull();
    Ok((node, removed, underflow))
}

/// Fix an underfull child of `parent` at `idx` by merging with a neighbor
/// or redistributing entries from it.
fn rebalance_child<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    alloc: &mut NodeAllocator<K, V, A, B>,
    parent: NodeRef,
    idx: usize,
) -> Result<(), AllocError> {
    let sibling = if idx > 0 { idx - 1 } else { idx + 1 };
    let (li, ri) = if sibling < idx {
        (sibling, idx)
    } else {
        (idx, sibling)
    };
    let (left, right) = {
        let inner = alloc.internal(parent);
        debug_assert!(ri < inner.len());
        (inner.child_at(li), inner.child_at(ri))
    };

    let total = if left.is_leaf() {
        alloc.leaf(left).len() + alloc.leaf(right).len()
    } else {
        alloc.internal(left).len() + alloc.internal(right).len()
    };

    if total <= B {
        // Merge the right node into (a thawed copy of) the left one; the
        // right node is retired outright.
        let left = alloc.thaw(left)?;
        if left.is_leaf() {
            let (target, source) = alloc.leaf_mut_with(left, right);
            target.merge_from(source);
        } else {
            let (target, source) = alloc.internal_mut_with(left, right);
            target.merge_from(source);
        }
        if !left.is_leaf() {
            refresh_internal_aggregate(alloc, left);
        }
        alloc.hold(right);
        let left_max = node_max_key(alloc, left);
        let inner = alloc.internal_mut(parent);
        inner.set_child(li, left);
        inner.remove_child_at(ri);
        inner.set_key(li, left_max);
    } else {
        let left = alloc.thaw(left)?;
        let right = alloc.thaw(right)?;
        if left.is_leaf() {
            let (l, r) = alloc.leaf_pair_mut(left, right);
            crate::leaf::LeafNode::redistribute(l, r);
        } else {
            let (l, r) = alloc.internal_pair_mut(left, right);
            crate::internode::InternalNode::redistribute(l, r);
            refresh_internal_aggregate(alloc, left);
            refresh_internal_aggregate(alloc, right);
        }
        let left_max = node_max_key(alloc, left);
        let right_max = node_max_key(alloc, right);
        let inner = alloc.internal_mut(parent);
        inner.set_child(li, left);
        inner.set_child(ri, right);
        inner.set_key(li, left_max);
        inner.set_key(ri, right_max);
    }
    Ok(())
}

// ============================================================================
//  Compaction walk
// ============================================================================

/// Move the subtree at `node` out of the buffers in `plan`, bottom-up.
/// Returns the replacement reference if anything changed.
fn compact_rec<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    alloc: &mut NodeAllocator<K, V, A, B>,
    plan: &CompactionPlan,
    node: NodeRef,
) -> Result<Option<NodeRef>, AllocError> {
    if node.is_leaf() {
        if plan.contains(node) {
            return alloc.evacuate_leaf(node).map(Some);
        }
        return Ok(None);
    }

    let len = alloc.internal(node).len();
    let mut moved: SmallVec<[(usize, NodeRef); MAX_EXPECTED_HEIGHT]> = SmallVec::new();
    for idx in 0..len {
        let child = alloc.internal(node).child_at(idx);
        if let Some(new_child) = compact_rec(alloc, plan, child)? {
            moved.push((idx, new_child));
        }
    }

    let evacuate_self = plan.contains(node);
    if moved.is_empty() && !evacuate_self {
        return Ok(None);
    }
    // Rewriting child links requires a mutable copy; either way the node
    // goes through the same thaw/hold protocol as a normal mutation.
    let new_node = if evacuate_self {
        alloc.evacuate_internal(node)?
    } else {
        alloc.thaw_internal(node)?
    };
    let inner = alloc.internal_mut(new_node);
    for &(idx, child) in &moved {
        inner.set_child(idx, child);
    }
    Ok(Some(new_node))
}

// ============================================================================
//  Shared helpers
// ============================================================================

/// Largest key in the subtree at `r` (the separator its parent should carry).
pub(crate) fn node_max_key<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize>(
    alloc: &NodeAllocator<K, V, A, B>,
    r: NodeRef,
) -> K {
    if r.is_leaf() {
        alloc.leaf(r).max_key()
    } else {
        alloc.internal(r).max_key()
    }
}

/// Refold an internal node's aggregate from its children's cached values.
pub(crate) fn refresh_internal_aggregate<
    K: TreeKey,
    V: TreeValue,
    A: Aggregate<V>,
    const B: usize,
>(
    alloc: &mut NodeAllocator<K, V, A, B>,
    r: NodeRef,
) {
    let folded = {
        let inner = alloc.internal(r);
        let mut acc = A::default();
        for &child in inner.children() {
            let child_aggr = if child.is_leaf() {
                alloc.leaf(child).aggregate()
            } else {
                alloc.internal(child).aggregate()
            };
            acc.merge(&child_aggr);
        }
        acc
    };
    alloc.internal_mut(r).set_aggregate(folded);
}

// ============================================================================
//  Tests
// ============================================================================
