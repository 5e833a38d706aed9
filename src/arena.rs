//! Typed node store.
//!
//! A [`NodeArena`] owns node storage as a fixed table of growable-by-
//! replacement buffers. Growth never edits an existing buffer in place: when
//! the active buffer fills, the allocator installs a fresh buffer under the
//! next table slot and moves its bump cursor there, so outstanding
//! [`NodeRef`]s survive growth by construction.
//!
//! # Sharing protocol
//!
//! The arena is written by exactly one writer thread and read concurrently
//! by any number of reader threads. Slot contents are published to readers
//! by the store's release store of the frozen root; after that point the
//! writer never writes the slot again until the reclamation protocol proves
//! no reader can reach it. [`NodeArena::resolve`] therefore has a safe
//! signature but a protocol contract: the caller must be the writer, or must
//! hold a generation guard covering the snapshot the ref was read from.
//!
//! Per-buffer occupancy bookkeeping lives in [`BufferState`], owned by the
//! allocator; it drives the compaction heuristics.

use std::cell::UnsafeCell;
use std::error::Error;
use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::AtomicPtr;

use crate::noderef::MAX_BUFFERS;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::tracing_helpers::trace_log;

/// Hard cap on slots per buffer; keeps offsets inside the `NodeRef` bit
/// field with the sentinel encoding left over.
pub const MAX_BUFFER_CAPACITY: u32 = 1 << 20;

// ============================================================================
//  AllocError
// ============================================================================

/// Failure to obtain node storage.
///
/// The only externally observable failure of this subsystem; surfaced by
/// `alloc`/`thaw` callers and never retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The process allocator refused to provide a new buffer.
    OutOfMemory,

    /// Every buffer-table slot is in use.
    ArenaExhausted,
}

impl StdFmt::Display for AllocError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "node buffer allocation failed"),
            Self::ArenaExhausted => write!(f, "node arena buffer table exhausted"),
        }
    }
}

impl Error for AllocError {}

// ============================================================================
//  Buffer
// ============================================================================

/// A fixed-capacity run of node slots.
struct Buffer<N> {
    slots: Box<[UnsafeCell<N>]>,
}

impl<N: Default> Buffer<N> {
    /// Allocate a buffer of `capacity` default (reclaimed-state) slots.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if the reservation fails.
    fn try_with_capacity(capacity: u32) -> Result<Self, AllocError> {
        let capacity = capacity as usize;
        let mut slots: Vec<UnsafeCell<N>> = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| AllocError::OutOfMemory)?;
        slots.extend((0..capacity).map(|_| UnsafeCell::new(N::default())));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }
}

// ============================================================================
//  NodeArena
// ============================================================================

/// Buffer-table node store for one node kind.
///
/// See the module docs for the sharing protocol.
pub struct NodeArena<N> {
    /// Buffer table; entries are installed with a Release store and loaded
    /// with Acquire so readers see fully initialized buffers.
    buffers: Box<[AtomicPtr<Buffer<N>>]>,
}

// SAFETY: slot access follows the single-writer / guarded-reader protocol
// described in the module docs; the buffer table itself is published with
// Release/Acquire pairs.
unsafe impl<N: Send + Sync> Send for NodeArena<N> {}
// SAFETY: as above.
unsafe impl<N: Send + Sync> Sync for NodeArena<N> {}

impl<N: Default> NodeArena<N> {
    /// Create an arena with an empty buffer table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: (0..MAX_BUFFERS)
                .map(|_| AtomicPtr::new(StdPtr::null_mut()))
                .collect(),
        }
    }

    /// Install a fresh buffer of `capacity` slots under table slot `id`.
    ///
    /// Writer-only. The table slot must be empty.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if the buffer cannot be allocated.
    pub(crate) fn install_buffer(&self, id: u32, capacity: u32) -> Result<(), AllocError> {
        debug_assert!((id as usize) < MAX_BUFFERS);
        debug_assert!(capacity <= MAX_BUFFER_CAPACITY);
        let buffer = Box::new(Buffer::try_with_capacity(capacity)?);
        trace_log!(buffer = id, capacity, "arena buffer installed");
        let prev = self.buffers[id as usize].swap(Box::into_raw(buffer), WRITE_ORD);
        debug_assert!(prev.is_null(), "buffer table slot {id} already occupied");
        Ok(())
    }

    /// Drop the buffer under table slot `id`, freeing all of its slots.
    ///
    /// Writer-only, and only legal once the reclamation protocol has proven
    /// that no reader guard can still reach a node inside the buffer.
    pub(crate) fn release_buffer(&self, id: u32) {
        let ptr = self.buffers[id as usize].swap(StdPtr::null_mut(), WRITE_ORD);
        debug_assert!(!ptr.is_null(), "releasing unoccupied buffer slot {id}");
        // SAFETY: the pointer came from Box::into_raw in install_buffer and
        // the protocol guarantees no outstanding references into the buffer.
        drop(unsafe { Box::from_raw(ptr) });
    }

    #[inline(always)]
    fn slot(&self, buffer: u32, offset: u32) -> *mut N {
        let ptr = self.buffers[buffer as usize].load(READ_ORD);
        debug_assert!(!ptr.is_null(), "resolve into unoccupied buffer {buffer}");
        // SAFETY: non-null table entries always point at a live Buffer; the
        // offset bound is checked against the slot slice.
        let buf: &Buffer<N> = unsafe { &*ptr };
        buf.slots[offset as usize].get()
    }

    /// Resolve a (buffer, offset) pair to a shared node view.
    ///
    /// Protocol contract: the caller is the writer, or holds a generation
    /// guard covering the snapshot this reference was read from. The slot
    /// must not have been reclaimed.
    #[inline(always)]
    pub(crate) fn resolve(&self, buffer: u32, offset: u32) -> &N {
        // SAFETY: per the protocol contract, no writer mutates this slot
        // while the returned reference is live.
        unsafe { &*self.slot(buffer, offset) }
    }

    /// Resolve a (buffer, offset) pair to an exclusive node view.
    ///
    /// # Safety
    /// Caller must be the single writer, the slot must be in the `Mutable`
    /// or `Reclaimed` state (unreachable by readers), and no other reference
    /// to this slot may be live.
    #[inline(always)]
    pub(crate) unsafe fn resolve_mut(&self, buffer: u32, offset: u32) -> &mut N {
        // SAFETY: forwarded to the caller.
        unsafe { &mut *self.slot(buffer, offset) }
    }
}

impl<N: Default> Default for NodeArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Drop for NodeArena<N> {
    fn drop(&mut self) {
        for entry in &*self.buffers {
            let ptr = entry.swap(StdPtr::null_mut(), WRITE_ORD);
            if !ptr.is_null() {
                // SAFETY: pointers in the table come from Box::into_raw and
                // are dropped exactly once, here or in release_buffer.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl<N> StdFmt::Debug for NodeArena<N> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let occupied = self
            .buffers
            .iter()
            .filter(|b| !b.load(READ_ORD).is_null())
            .count();
        f.debug_struct("NodeArena")
            .field("occupied_buffers", &occupied)
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  BufferState
// ============================================================================

/// Writer-side occupancy bookkeeping for one buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferState {
    /// Total slots in the buffer (0 = table slot unoccupied).
    pub capacity: u32,

    /// Bump-allocation cursor; slots below it have been handed out at least
    /// once.
    pub used: u32,

    /// Handed-out slots that have since been reclaimed (free-listed or
    /// abandoned to compaction).
    pub dead: u32,

    /// Buffer is being evacuated; no new allocations land here and freed
    /// slots are not reused.
    pub compacting: bool,
}

impl BufferState {
    /// Slots currently holding live (non-reclaimed) nodes.
    #[must_use]
    #[inline]
    pub const fn live(&self) -> u32 {
        self.used - self.dead
    }

    /// Whether the bump region is exhausted.
    #[must_use]
    #[inline]
    pub const fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    /// Whether the dead-slot share exceeds `percent` of handed-out slots.
    #[must_use]
    #[inline]
    pub const fn dead_ratio_exceeds(&self, percent: u32) -> bool {
        self.dead as u64 * 100 > self.used as u64 * percent as u64
    }
}

// ============================================================================
//  Tests
// ============================================================================
