//! Node allocation and reclamation orchestration.
//!
//! The [`NodeAllocator`] owns the writer-side view of both arenas and drives
//! the whole node lifecycle:
//!
//! - `alloc_leaf` / `alloc_internal` create `Mutable` nodes invisible to
//!   readers.
//! - `thaw_*` is the copy-on-write step: a `Frozen` node is copied into a
//!   fresh `Mutable` slot and the original queued for retirement; an
//!   already-`Mutable` node is returned unchanged (single-writer
//!   optimization).
//! - `hold` retires a node that is being removed outright (post-merge);
//!   never-frozen nodes are freed immediately since no reader saw them.
//! - `freeze` flips every node handed out since the last freeze to `Frozen`
//!   (a state-bit flip; the copying already happened at thaw time).
//! - `transfer_hold_lists(g)` stamps the pending retirements with the
//!   generation they became unreachable under. The indirection exists
//!   because a node can be replaced several times inside one unfrozen
//!   mutation window; only versions live at freeze time need a tag.
//! - `trim_hold_lists(g)` reclaims every retirement stamped strictly below
//!   `g`. The caller must prove `g` is at most the oldest observed
//!   generation; violating that is use-after-reclaim.
//!
//! Compaction (`start_compact` / `finish_compact`) evacuates fragmented
//! buffers through the identical thaw/hold path, so buffer storage is only
//! freed once the generation protocol clears it.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::arena::{AllocError, BufferState, NodeArena, MAX_BUFFER_CAPACITY};
use crate::internode::InternalNode;
use crate::leaf::LeafNode;
use crate::node::{NodeState, StateCell};
use crate::noderef::{NodeRef, MAX_BUFFERS};
use crate::store::StoreShared;
use crate::tracing_helpers::{debug_log, trace_log};
use crate::{TreeKey, TreeValue};

// ============================================================================
//  AllocatorConfig
// ============================================================================

/// Tuning knobs for buffer growth and compaction.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    initial_buffer_capacity: u32,
    max_buffer_capacity: u32,
    compaction_dead_ratio_percent: u32,
}

impl AllocatorConfig {
    /// Capacity of the first buffer per node kind. Later buffers double up
    /// to the maximum.
    #[must_use]
    pub fn with_initial_buffer_capacity(mut self, capacity: u32) -> Self {
        assert!(capacity >= 1 && capacity <= MAX_BUFFER_CAPACITY);
        self.initial_buffer_capacity = capacity;
        self
    }

    /// Upper bound on per-buffer capacity.
    #[must_use]
    pub fn with_max_buffer_capacity(mut self, capacity: u32) -> Self {
        assert!(capacity >= 1 && capacity <= MAX_BUFFER_CAPACITY);
        self.max_buffer_capacity = capacity;
        self
    }

    /// Dead-slot percentage above which a buffer becomes a compaction
    /// candidate.
    #[must_use]
    pub fn with_compaction_dead_ratio_percent(mut self, percent: u32) -> Self {
        assert!(percent <= 100);
        self.compaction_dead_ratio_percent = percent;
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            initial_buffer_capacity: 64,
            max_buffer_capacity: MAX_BUFFER_CAPACITY,
            compaction_dead_ratio_percent: 30,
        }
    }
}

// ============================================================================
//  Bookkeeping types
// ============================================================================

/// Writer-side allocation state for one node kind.
#[derive(Debug, Default)]
struct SideState {
    /// Current bump buffer, or `None` before the first allocation.
    active: Option<u32>,

    /// Occupancy bookkeeping indexed by buffer id.
    states: Vec<BufferState>,

    /// Reclaimed slots available for reuse.
    free: Vec<NodeRef>,

    /// Buffer ids released by compaction, available for reuse.
    free_ids: Vec<u32>,

    /// Next never-used buffer id.
    next_buffer_id: u32,

    /// Capacity for the next installed buffer.
    next_capacity: u32,
}

impl SideState {
    fn new(config: &AllocatorConfig) -> Self {
        Self {
            next_capacity: config.initial_buffer_capacity,
            ..Self::default()
        }
    }

    fn buffer_count(&self) -> usize {
        self.states.iter().filter(|s| s.capacity > 0).count()
    }

    fn occupied_slots(&self) -> usize {
        self.states.iter().map(|s| s.live() as usize).sum()
    }
}

/// Retired nodes stamped with the generation they became unreachable under.
#[derive(Debug)]
struct HoldBatch {
    generation: u64,
    refs: Vec<NodeRef>,
}

/// A compacted buffer awaiting generation-safe release.
#[derive(Debug, Clone, Copy)]
struct HeldBuffer {
    leaf: bool,
    id: u32,
}

/// Buffers selected for evacuation by [`NodeAllocator::start_compact`].
///
/// Passed to the tree's compaction walk so it knows which nodes to move,
/// then returned to [`NodeAllocator::finish_compact`].
#[derive(Debug, Default)]
pub struct CompactionPlan {
    leaf_buffers: Vec<u32>,
    internal_buffers: Vec<u32>,
}

impl CompactionPlan {
    /// Whether no buffer was selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaf_buffers.is_empty() && self.internal_buffers.is_empty()
    }

    /// Whether the given node lives in a buffer being evacuated.
    #[must_use]
    pub fn contains(&self, node: NodeRef) -> bool {
        let buffers = if node.is_leaf() {
            &self.leaf_buffers
        } else {
            &self.internal_buffers
        };
        buffers.contains(&node.buffer_id())
    }
}

/// Point-in-time allocator occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Leaf slots holding a non-reclaimed node (frozen, mutable or held).
    pub occupied_leaves: usize,

    /// Internal slots holding a non-reclaimed node.
    pub occupied_internals: usize,

    /// Reclaimed slots available for reuse.
    pub free_slots: usize,

    /// Nodes in the `Held` state awaiting a safe generation.
    pub held_nodes: usize,

    /// Retired nodes not yet stamped with a generation.
    pub pending_hold: usize,

    /// Installed buffers across both arenas.
    pub buffers: usize,
}

// ============================================================================
//  NodeAllocator
// ============================================================================

/// Writer-side owner of node storage and the freeze/hold/trim protocol.
///
/// Exactly one allocator exists per store, used only from the writer thread.
pub struct NodeAllocator<K, V, A, const B: usize> {
    shared: Arc<StoreShared<K, V, A, B>>,
    config: AllocatorConfig,
    leaf_side: SideState,
    internal_side: SideState,

    /// Every node handed out (alloc or thaw) since the last freeze.
    to_freeze: Vec<NodeRef>,

    /// Retired nodes awaiting a generation stamp at the next freeze.
    hold_pending: Vec<NodeRef>,

    /// Generation-stamped retirements, oldest first.
    hold_queue: VecDeque<HoldBatch>,

    /// Evacuated buffers awaiting a generation stamp.
    buffer_hold_pending: Vec<HeldBuffer>,

    /// Generation-stamped evacuated buffers, oldest first.
    buffer_hold_queue: VecDeque<(u64, Vec<HeldBuffer>)>,

    /// Nodes currently in the `Held` state.
    held_nodes: usize,
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> NodeAllocator<K, V, A, B> {
    pub(crate) fn new(shared: Arc<StoreShared<K, V, A, B>>, config: AllocatorConfig) -> Self {
        Self {
            shared,
            leaf_side: SideState::new(&config),
            internal_side: SideState::new(&config),
            config,
            to_freeze: Vec::new(),
            hold_pending: Vec::new(),
            hold_queue: VecDeque::new(),
            buffer_hold_pending: Vec::new(),
            buffer_hold_queue: VecDeque::new(),
            held_nodes: 0,
        }
    }

    pub(crate) fn shared(&self) -> &StoreShared<K, V, A, B> {
        &self.shared
    }

    // ========================================================================
    //  Allocation
    // ========================================================================

    /// Allocate an empty mutable leaf, not yet reachable from any snapshot.
    ///
    /// # Errors
    /// [`AllocError`] if buffer growth fails; never retried internally.
    pub fn alloc_leaf(&mut self) -> Result<NodeRef, AllocError> {
        let r = allocate_slot(&self.shared.leaves, &mut self.leaf_side, &self.config, true)?;
        // SAFETY: freshly allocated slot; writer-exclusive, unreachable by
        // readers.
        unsafe { self.shared.leaves.resolve_mut(r.buffer_id(), r.offset()) }.reset();
        self.to_freeze.push(r);
        Ok(r)
    }

    /// Allocate an empty mutable internal node at `level`.
    ///
    /// # Errors
    /// [`AllocError`] if buffer growth fails.
    pub fn alloc_internal(&mut self, level: u8) -> Result<NodeRef, AllocError> {
        let r = allocate_slot(
            &self.shared.internals,
            &mut self.internal_side,
            &self.config,
            false,
        )?;
        // SAFETY: as in alloc_leaf.
        unsafe { self.shared.internals.resolve_mut(r.buffer_id(), r.offset()) }.reset(level);
        self.to_freeze.push(r);
        Ok(r)
    }

    // ========================================================================
    //  Thaw (copy-on-write)
    // ========================================================================

    /// Produce a mutable version of the leaf at `r`.
    ///
    /// Frozen nodes are copied and the original queued for retirement;
    /// mutable nodes are returned unchanged.
    ///
    /// # Errors
    /// [`AllocError`] if the copy cannot be allocated.
    pub fn thaw_leaf(&mut self, r: NodeRef) -> Result<NodeRef, AllocError> {
        debug_assert!(r.valid() && r.is_leaf());
        match self.leaf(r).state().load() {
            NodeState::Mutable => Ok(r),
            NodeState::Frozen => {
                let dst =
                    allocate_slot(&self.shared.leaves, &mut self.leaf_side, &self.config, true)?;
                // SAFETY: dst is a fresh writer-exclusive slot; src is a
                // distinct slot read-only here.
                let dst_node =
                    unsafe { self.shared.leaves.resolve_mut(dst.buffer_id(), dst.offset()) };
                dst_node.thaw_from(self.shared.leaves.resolve(r.buffer_id(), r.offset()));
                self.to_freeze.push(dst);
                self.hold_frozen(r);
                Ok(dst)
            }
            state => unreachable!("thaw of leaf in state {state:?}"),
        }
    }

    /// Produce a mutable version of the internal node at `r`.
    ///
    /// # Errors
    /// [`AllocError`] if the copy cannot be allocated.
    pub fn thaw_internal(&mut self, r: NodeRef) -> Result<NodeRef, AllocError> {
        debug_assert!(r.valid() && !r.is_leaf());
        match self.internal(r).state().load() {
            NodeState::Mutable => Ok(r),
            NodeState::Frozen => {
                let dst = allocate_slot(
                    &self.shared.internals,
                    &mut self.internal_side,
                    &self.config,
                    false,
                )?;
                // SAFETY: as in thaw_leaf.
                let dst_node =
                    unsafe { self.shared.internals.resolve_mut(dst.buffer_id(), dst.offset()) };
                dst_node.thaw_from(self.shared.internals.resolve(r.buffer_id(), r.offset()));
                self.to_freeze.push(dst);
                self.hold_frozen(r);
                Ok(dst)
            }
            state => unreachable!("thaw of internal node in state {state:?}"),
        }
    }

    /// Thaw dispatching on the reference kind.
    ///
    /// # Errors
    /// [`AllocError`] if the copy cannot be allocated.
    pub fn thaw(&mut self, r: NodeRef) -> Result<NodeRef, AllocError> {
        if r.is_leaf() {
            self.thaw_leaf(r)
        } else {
            self.thaw_internal(r)
        }
    }

    // ========================================================================
    //  Hold / freeze / trim
    // ========================================================================

    /// Retire a node that is being removed from the tree outright.
    ///
    /// Frozen nodes are queued until a generation proves them unobservable;
    /// nodes that were never frozen are freed immediately.
    pub fn hold(&mut self, r: NodeRef) {
        match self.node_state(r) {
            NodeState::Mutable => self.release_now(r),
            NodeState::Frozen => self.hold_frozen(r),
            state => unreachable!("hold of node in state {state:?}"),
        }
    }

    /// Whether any node handed out since the last freeze is still mutable.
    #[must_use]
    pub fn needs_freeze(&self) -> bool {
        !self.to_freeze.is_empty()
    }

    /// Flip every node handed out since the last freeze to `Frozen`,
    /// returning how many were flipped.
    ///
    /// This is the cheap half of publication: the caller follows up with the
    /// frozen-root store and the generation bump.
    pub fn freeze(&mut self) -> usize {
        let mut flipped = 0_usize;
        for i in 0..self.to_freeze.len() {
            let r = self.to_freeze[i];
            let cell = self.state_cell(r);
            // A slot freed and reused inside one window appears twice; only
            // the occupant still mutable needs the flip.
            if cell.load() == NodeState::Mutable {
                cell.transition(NodeState::Mutable, NodeState::Frozen);
                flipped += 1;
            }
        }
        self.to_freeze.clear();
        debug_log!(flipped, "froze mutable nodes");
        flipped
    }

    /// Stamp all pending retirements with `generation` (the generation that
    /// just became unobservable by future readers).
    pub fn transfer_hold_lists(&mut self, generation: u64) {
        if let Some(back) = self.hold_queue.back() {
            debug_assert!(back.generation <= generation, "generation went backwards");
        }
        if !self.hold_pending.is_empty() {
            let refs = std::mem::take(&mut self.hold_pending);
            trace_log!(generation, count = refs.len(), "hold list transferred");
            self.hold_queue.push_back(HoldBatch { generation, refs });
        }
        if !self.buffer_hold_pending.is_empty() {
            let buffers = std::mem::take(&mut self.buffer_hold_pending);
            self.buffer_hold_queue.push_back((generation, buffers));
        }
    }

    /// Reclaim every retirement stamped strictly below `used_generation`,
    /// returning how many nodes were reclaimed.
    ///
    /// The caller must guarantee `used_generation` is at most the oldest
    /// generation any live guard observes; reclaiming a generation still
    /// observed is use-after-reclaim and is caught by debug assertions in
    /// the state machine.
    pub fn trim_hold_lists(&mut self, used_generation: u64) -> usize {
        let mut reclaimed = 0_usize;
        while self
            .hold_queue
            .front()
            .is_some_and(|b| b.generation < used_generation)
        {
            let batch = self.hold_queue.pop_front().expect("front checked");
            reclaimed += batch.refs.len();
            for r in batch.refs {
                self.reclaim(r);
            }
        }
        while self
            .buffer_hold_queue
            .front()
            .is_some_and(|(g, _)| *g < used_generation)
        {
            let (_, buffers) = self.buffer_hold_queue.pop_front().expect("front checked");
            for held in buffers {
                self.release_held_buffer(held);
            }
        }
        if reclaimed > 0 {
            debug_log!(used_generation, reclaimed, "trimmed hold lists");
        }
        reclaimed
    }

    // ========================================================================
    //  Compaction
    // ========================================================================

    /// Select fragmented buffers for evacuation and fence them from further
    /// allocation. Driven by occupancy, not by a schedule.
    pub fn start_compact(&mut self) -> CompactionPlan {
        let mut plan = CompactionPlan::default();
        let percent = self.config.compaction_dead_ratio_percent;
        for (side, out) in [
            (&mut self.leaf_side, &mut plan.leaf_buffers),
            (&mut self.internal_side, &mut plan.internal_buffers),
        ] {
            for id in 0..side.states.len() {
                #[allow(clippy::cast_possible_truncation)]
                let id = id as u32;
                let state = side.states[id as usize];
                if state.capacity == 0 || state.compacting || side.active == Some(id) {
                    continue;
                }
                if state.used > 0 && (state.live() == 0 || state.dead_ratio_exceeds(percent)) {
                    side.states[id as usize].compacting = true;
                    // Free-listed slots inside the buffer are gone for good.
                    side.free.retain(|r| r.buffer_id() != id);
                    out.push(id);
                }
            }
        }
        if !plan.is_empty() {
            debug_log!(
                leaf_buffers = plan.leaf_buffers.len(),
                internal_buffers = plan.internal_buffers.len(),
                "compaction started"
            );
        }
        plan
    }

    /// Queue the evacuated buffers for generation-safe release.
    ///
    /// Call after the tree walk has moved every live node out of them.
    pub fn finish_compact(&mut self, plan: CompactionPlan) {
        for id in plan.leaf_buffers {
            self.buffer_hold_pending.push(HeldBuffer { leaf: true, id });
        }
        for id in plan.internal_buffers {
            self.buffer_hold_pending.push(HeldBuffer { leaf: false, id });
        }
    }

    /// Move the leaf at `r` into a fresh slot, whatever its state.
    ///
    /// Used by the compaction walk. Frozen nodes go through the ordinary
    /// thaw path; mutable nodes are moved and their old slot freed at once.
    ///
    /// # Errors
    /// [`AllocError`] if the destination cannot be allocated.
    pub(crate) fn evacuate_leaf(&mut self, r: NodeRef) -> Result<NodeRef, AllocError> {
        match self.leaf(r).state().load() {
            NodeState::Frozen => self.thaw_leaf(r),
            NodeState::Mutable => {
                let dst =
                    allocate_slot(&self.shared.leaves, &mut self.leaf_side, &self.config, true)?;
                // SAFETY: dst fresh and writer-exclusive; src distinct.
                let dst_node =
                    unsafe { self.shared.leaves.resolve_mut(dst.buffer_id(), dst.offset()) };
                dst_node.thaw_from(self.shared.leaves.resolve(r.buffer_id(), r.offset()));
                self.to_freeze.push(dst);
                self.release_now(r);
                Ok(dst)
            }
            state => unreachable!("evacuate of leaf in state {state:?}"),
        }
    }

    /// Internal-node counterpart of [`evacuate_leaf`](Self::evacuate_leaf).
    ///
    /// # Errors
    /// [`AllocError`] if the destination cannot be allocated.
    pub(crate) fn evacuate_internal(&mut self, r: NodeRef) -> Result<NodeRef, AllocError> {
        match self.internal(r).state().load() {
            NodeState::Frozen => self.thaw_internal(r),
            NodeState::Mutable => {
                let dst = allocate_slot(
                    &self.shared.internals,
                    &mut self.internal_side,
                    &self.config,
                    false,
                )?;
                // SAFETY: as in evacuate_leaf.
                let dst_node =
                    unsafe { self.shared.internals.resolve_mut(dst.buffer_id(), dst.offset()) };
                dst_node.thaw_from(self.shared.internals.resolve(r.buffer_id(), r.offset()));
                self.to_freeze.push(dst);
                self.release_now(r);
                Ok(dst)
            }
            state => unreachable!("evacuate of internal node in state {state:?}"),
        }
    }

    // ========================================================================
    //  Resolution (writer-side)
    // ========================================================================

    /// Shared view of the leaf at `r`.
    pub(crate) fn leaf(&self, r: NodeRef) -> &LeafNode<K, V, A, B> {
        debug_assert!(r.valid() && r.is_leaf());
        self.shared.leaves.resolve(r.buffer_id(), r.offset())
    }

    /// Shared view of the internal node at `r`.
    pub(crate) fn internal(&self, r: NodeRef) -> &InternalNode<K, A, B> {
        debug_assert!(r.valid() && !r.is_leaf());
        self.shared.internals.resolve(r.buffer_id(), r.offset())
    }

    /// Exclusive view of the mutable leaf at `r`.
    pub(crate) fn leaf_mut(&mut self, r: NodeRef) -> &mut LeafNode<K, V, A, B> {
        debug_assert!(r.valid() && r.is_leaf());
        debug_assert_eq!(self.leaf(r).state().load(), NodeState::Mutable);
        // SAFETY: writer-exclusive (&mut self), node is Mutable so no reader
        // can reach it.
        unsafe { self.shared.leaves.resolve_mut(r.buffer_id(), r.offset()) }
    }

    /// Exclusive view of the mutable internal node at `r`.
    pub(crate) fn internal_mut(&mut self, r: NodeRef) -> &mut InternalNode<K, A, B> {
        debug_assert!(r.valid() && !r.is_leaf());
        debug_assert_eq!(self.internal(r).state().load(), NodeState::Mutable);
        // SAFETY: as in leaf_mut.
        unsafe { self.shared.internals.resolve_mut(r.buffer_id(), r.offset()) }
    }

    /// Exclusive views of two distinct mutable leaves.
    pub(crate) fn leaf_pair_mut(
        &mut self,
        a: NodeRef,
        b: NodeRef,
    ) -> (&mut LeafNode<K, V, A, B>, &mut LeafNode<K, V, A, B>) {
        assert_ne!(a, b, "aliasing leaf pair");
        debug_assert_eq!(self.leaf(a).state().load(), NodeState::Mutable);
        debug_assert_eq!(self.leaf(b).state().load(), NodeState::Mutable);
        // SAFETY: distinct slots, both mutable, writer-exclusive.
        unsafe {
            (
                self.shared.leaves.resolve_mut(a.buffer_id(), a.offset()),
                self.shared.leaves.resolve_mut(b.buffer_id(), b.offset()),
            )
        }
    }

    /// Exclusive views of two distinct mutable internal nodes.
    pub(crate) fn internal_pair_mut(
        &mut self,
        a: NodeRef,
        b: NodeRef,
    ) -> (&mut InternalNode<K, A, B>, &mut InternalNode<K, A, B>) {
        assert_ne!(a, b, "aliasing internal pair");
        debug_assert_eq!(self.internal(a).state().load(), NodeState::Mutable);
        debug_assert_eq!(self.internal(b).state().load(), NodeState::Mutable);
        // SAFETY: as in leaf_pair_mut.
        unsafe {
            (
                self.shared.internals.resolve_mut(a.buffer_id(), a.offset()),
                self.shared.internals.resolve_mut(b.buffer_id(), b.offset()),
            )
        }
    }

    /// Exclusive view of a mutable leaf alongside a shared view of another.
    pub(crate) fn leaf_mut_with(
        &mut self,
        target: NodeRef,
        other: NodeRef,
    ) -> (&mut LeafNode<K, V, A, B>, &LeafNode<K, V, A, B>) {
        assert_ne!(target, other, "aliasing leaf pair");
        debug_assert_eq!(self.leaf(target).state().load(), NodeState::Mutable);
        // SAFETY: distinct slots; target mutable and writer-exclusive, other
        // only read.
        unsafe {
            (
                self.shared
                    .leaves
                    .resolve_mut(target.buffer_id(), target.offset()),
                self.shared.leaves.resolve(other.buffer_id(), other.offset()),
            )
        }
    }

    /// Exclusive view of a mutable internal node alongside a shared view of
    /// another.
    pub(crate) fn internal_mut_with(
        &mut self,
        target: NodeRef,
        other: NodeRef,
    ) -> (&mut InternalNode<K, A, B>, &InternalNode<K, A, B>) {
        assert_ne!(target, other, "aliasing internal pair");
        debug_assert_eq!(self.internal(target).state().load(), NodeState::Mutable);
        // SAFETY: as in leaf_mut_with.
        unsafe {
            (
                self.shared
                    .internals
                    .resolve_mut(target.buffer_id(), target.offset()),
                self.shared
                    .internals
                    .resolve(other.buffer_id(), other.offset()),
            )
        }
    }

    /// Lifecycle state of the node at `r`.
    pub(crate) fn node_state(&self, r: NodeRef) -> NodeState {
        self.state_cell(r).load()
    }

    fn state_cell(&self, r: NodeRef) -> &StateCell {
        if r.is_leaf() {
            self.leaf(r).state()
        } else {
            self.internal(r).state()
        }
    }

    // ========================================================================
    //  Stats
    // ========================================================================

    /// Point-in-time occupancy counters.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            occupied_leaves: self.leaf_side.occupied_slots(),
            occupied_internals: self.internal_side.occupied_slots(),
            free_slots: self.leaf_side.free.len() + self.internal_side.free.len(),
            held_nodes: self.held_nodes,
            pending_hold: self.hold_pending.len(),
            buffers: self.leaf_side.buffer_count() + self.internal_side.buffer_count(),
        }
    }

    // ========================================================================
    //  Internals
    // ========================================================================

    fn hold_frozen(&mut self, r: NodeRef) {
        self.state_cell(r).transition(NodeState::Frozen, NodeState::Held);
        self.hold_pending.push(r);
        self.held_nodes += 1;
    }

    /// Free a node that never left the writer: no reader can have seen it.
    fn release_now(&mut self, r: NodeRef) {
        self.state_cell(r)
            .transition(NodeState::Mutable, NodeState::Reclaimed);
        self.release_slot(r);
    }

    /// Reclaim a held node whose generation has been proven unobservable.
    fn reclaim(&mut self, r: NodeRef) {
        self.state_cell(r).transition(NodeState::Held, NodeState::Reclaimed);
        self.held_nodes -= 1;
        self.release_slot(r);
    }

    fn release_slot(&mut self, r: NodeRef) {
        let side = if r.is_leaf() {
            &mut self.leaf_side
        } else {
            &mut self.internal_side
        };
        let state = &mut side.states[r.buffer_id() as usize];
        state.dead += 1;
        if !state.compacting {
            side.free.push(r);
        }
    }

    fn release_held_buffer(&mut self, held: HeldBuffer) {
        let side = if held.leaf {
            &mut self.leaf_side
        } else {
            &mut self.internal_side
        };
        let state = &mut side.states[held.id as usize];
        debug_assert!(state.compacting, "releasing a buffer not being compacted");
        debug_assert_eq!(state.live(), 0, "releasing a buffer with live nodes");
        *state = BufferState::default();
        side.free_ids.push(held.id);
        if held.leaf {
            self.shared.leaves.release_buffer(held.id);
        } else {
            self.shared.internals.release_buffer(held.id);
        }
        trace_log!(buffer = held.id, leaf = held.leaf, "compacted buffer released");
    }
}

impl<K: TreeKey, V: TreeValue, A: Aggregate<V>, const B: usize> std::fmt::Debug
    for NodeAllocator<K, V, A, B>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAllocator")
            .field("stats", &self.stats())
            .field("to_freeze", &self.to_freeze.len())
            .field("hold_queue", &self.hold_queue.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Slot allocation
// ============================================================================

/// Hand out a reclaimed slot, bump-allocating (and growing) as needed.
///
/// Free function so the caller can split borrows between one arena and its
/// side state.
fn allocate_slot<N: Default>(
    arena: &NodeArena<N>,
    side: &mut SideState,
    config: &AllocatorConfig,
    leaf: bool,
) -> Result<NodeRef, AllocError> {
    if let Some(r) = side.free.pop() {
        let state = &mut side.states[r.buffer_id() as usize];
        debug_assert!(!state.compacting, "free list entry in compacting buffer");
        state.dead -= 1;
        return Ok(r);
    }
    loop {
        if let Some(active) = side.active {
            let state = &mut side.states[active as usize];
            if !state.is_full() {
                let offset = state.used;
                state.used += 1;
                let r = if leaf {
                    NodeRef::new_leaf(active, offset)
                } else {
                    NodeRef::new_internal(active, offset)
                };
                return Ok(r);
            }
        }

        let id = match side.free_ids.pop() {
            Some(id) => id,
            None => {
                if side.next_buffer_id as usize >= MAX_BUFFERS {
                    return Err(AllocError::ArenaExhausted);
                }
                let id = side.next_buffer_id;
                side.next_buffer_id += 1;
                id
            }
        };
        let capacity = side
            .next_capacity
            .min(config.max_buffer_capacity)
            .min(MAX_BUFFER_CAPACITY)
            .max(1);
        arena.install_buffer(id, capacity)?;
        if side.states.len() <= id as usize {
            side.states.resize_with(id as usize + 1, BufferState::default);
        }
        side.states[id as usize] = BufferState {
            capacity,
            used: 0,
            dead: 0,
            compacting: false,
        };
        side.next_capacity = capacity.saturating_mul(2).min(config.max_buffer_capacity);
        side.active = Some(id);
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::NoAggregate;
    use crate::store::StoreShared;

    type Alloc = NodeAllocator<u64, u64, NoAggregate, 8>;

    fn small_alloc() -> Alloc {
        let config = AllocatorConfig::default().with_initial_buffer_capacity(4);
        NodeAllocator::new(Arc::new(StoreShared::new()), config)
    }

    #[test]
    fn test_alloc_produces_mutable_nodes() {
        let mut alloc = small_alloc();
        let leaf = alloc.alloc_leaf().unwrap();
        let inner = alloc.alloc_internal(1).unwrap();

        assert!(leaf.is_leaf());
        assert!(!inner.is_leaf());
        assert_eq!(alloc.node_state(leaf), NodeState::Mutable);
        assert_eq!(alloc.node_state(inner), NodeState::Mutable);
        assert_eq!(alloc.internal(inner).level(), 1);
        assert!(alloc.needs_freeze());
    }

    #[test]
    fn test_buffer_growth_on_demand() {
        let mut alloc = small_alloc();
        let refs: Vec<NodeRef> = (0..20).map(|_| alloc.alloc_leaf().unwrap()).collect();

        // 20 nodes across 4-then-8-then-16 slot buffers: at least 3 buffers.
        let distinct: std::collections::HashSet<u32> =
            refs.iter().map(|r| r.buffer_id()).collect();
        assert!(distinct.len() >= 3);
        assert_eq!(alloc.stats().occupied_leaves, 20);
    }

    #[test]
    fn test_thaw_of_mutable_is_identity() {
        let mut alloc = small_alloc();
        let leaf = alloc.alloc_leaf().unwrap();
        assert_eq!(alloc.thaw_leaf(leaf).unwrap(), leaf);
        assert_eq!(alloc.stats().pending_hold, 0);
    }

    #[test]
    fn test_thaw_of_frozen_copies_and_holds() {
        let mut alloc = small_alloc();
        let leaf = alloc.alloc_leaf().unwrap();
        alloc.leaf_mut(leaf).insert_at(0, 5, 50);
        alloc.freeze();
        assert_eq!(alloc.node_state(leaf), NodeState::Frozen);

        let copy = alloc.thaw_leaf(leaf).unwrap();
        assert_ne!(copy, leaf);
        assert_eq!(alloc.node_state(leaf), NodeState::Held);
        assert_eq!(alloc.node_state(copy), NodeState::Mutable);
        assert_eq!(alloc.leaf(copy).keys(), &[5]);
        assert_eq!(alloc.stats().pending_hold, 1);
    }

    #[test]
    fn test_hold_of_mutable_frees_immediately() {
        let mut alloc = small_alloc();
        let leaf = alloc.alloc_leaf().unwrap();
        alloc.hold(leaf);
        assert_eq!(alloc.stats().occupied_leaves, 0);
        assert_eq!(alloc.stats().free_slots, 1);

        // The freed slot is reused by the next allocation.
        let again = alloc.alloc_leaf().unwrap();
        assert_eq!(again, leaf);
    }

    #[test]
    fn test_trim_respects_generation_tags() {
        let mut alloc = small_alloc();
        let leaf = alloc.alloc_leaf().unwrap();
        alloc.freeze();
        let copy = alloc.thaw_leaf(leaf).unwrap();
        alloc.freeze();
        alloc.transfer_hold_lists(0);

        // Tagged with generation 0: trimming at 0 keeps it, 1 frees it.
        alloc.trim_hold_lists(0);
        assert_eq!(alloc.stats().held_nodes, 1);
        alloc.trim_hold_lists(1);
        assert_eq!(alloc.stats().held_nodes, 0);
        assert_eq!(alloc.node_state(copy), NodeState::Frozen);
        assert_eq!(alloc.stats().free_slots, 1);
    }

    #[test]
    fn test_freeze_skips_reclaimed_entries() {
        let mut alloc = small_alloc();
        let a = alloc.alloc_leaf().unwrap();
        alloc.hold(a); // freed before freeze; slot reused below
        let b = alloc.alloc_leaf().unwrap();
        assert_eq!(a, b);
        alloc.freeze();
        assert_eq!(alloc.node_state(b), NodeState::Frozen);
    }

    #[test]
    fn test_compaction_plan_selection() {
        let mut alloc = small_alloc();
        // Fill buffer 0 (4 slots) plus part of buffer 1, then kill all of
        // buffer 0's nodes.
        let refs: Vec<NodeRef> = (0..8).map(|_| alloc.alloc_leaf().unwrap()).collect();
        for &r in &refs[..4] {
            alloc.hold(r); // mutable: freed immediately, counted dead
        }

        let plan = alloc.start_compact();
        assert!(plan.contains(refs[0]));
        assert!(!plan.contains(refs[7])); // active buffer excluded
        alloc.finish_compact(plan);
        alloc.transfer_hold_lists(3);

        // Not yet safe at generation 3; released at 4. The freed buffer id
        // is reused by later growth.
        alloc.trim_hold_lists(3);
        let buffers_before = alloc.stats().buffers;
        alloc.trim_hold_lists(4);
        assert_eq!(alloc.stats().buffers, buffers_before - 1);
    }
}
