//! Generation tracking and reader guards.
//!
//! The [`GenerationHandler`] owns a monotonically increasing generation
//! counter and a registry of currently-active reader guards. The writer
//! bumps the generation once per freeze cycle; every reader takes a
//! [`GenGuard`] before walking a frozen snapshot and drops it when done.
//! [`oldest_observed_generation`](GenerationHandler::oldest_observed_generation)
//! is then the proof line for reclamation: storage retired under an older
//! generation can no longer be reached by any live reader.
//!
//! One handler may be shared (via `Arc`) across many tree instances so that
//! a whole subsystem trims against a single epoch.
//!
//! # Implementation
//!
//! Generations with live readers form a singly linked list of refcounted
//! hold records, oldest first. Readers touch only the newest record:
//! increment its refcount, then re-check that it is still the newest and
//! retry if not. The writer appends a record per bump and prunes fully
//! released records from the front onto a free list. Records are recycled
//! but never deallocated while the handler lives, which is what makes the
//! reader-side retry loop safe without any reader-visible locking.
//!
//! The increment-then-validate on the reader side races against the
//! publish-then-scan on the writer side in both directions; both sides use
//! SeqCst (see [`GUARD_ORD`]) so that at least one of them must observe the
//! other.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64};

use parking_lot::Mutex;

use crate::ordering::{GUARD_ORD, GUARD_RELEASE_ORD, READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::trace_log;

// ============================================================================
//  GenHold
// ============================================================================

/// One generation with (potentially) live readers.
struct GenHold {
    /// Generation this record stands for. Rewritten only while the record
    /// is off the active list with no references.
    generation: AtomicU64,

    /// Number of live guards pinning this generation.
    refs: AtomicU32,

    /// Next (newer) record in the active list; writer-only, under the
    /// handler lock.
    next: AtomicPtr<GenHold>,
}

impl GenHold {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            refs: AtomicU32::new(0),
            next: AtomicPtr::new(StdPtr::null_mut()),
        }
    }
}

// ============================================================================
//  GenerationHandler
// ============================================================================

/// Writer-side list state, serialized by the handler lock.
struct HandlerInner {
    /// Oldest record still on the active list.
    first: *mut GenHold,

    /// Fully released records awaiting reuse. Never deallocated before the
    /// handler drops; a stale reader may still transiently bump their
    /// refcounts.
    free: Vec<*mut GenHold>,
}

// SAFETY: the raw pointers are only dereferenced under the handler lock or
// through the guarded reader protocol; the pointees live as long as the
// handler.
unsafe impl Send for HandlerInner {}

/// Tracks the current generation and all generations still observed by a
/// live reader guard.
pub struct GenerationHandler {
    /// Generation currently being written.
    current: AtomicU64,

    /// Newest hold record (always represents `current`); the only record
    /// readers interact with.
    last: AtomicPtr<GenHold>,

    inner: Mutex<HandlerInner>,
}

// SAFETY: see HandlerInner; `last` is published with SeqCst and pointees
// outlive all guards (guards borrow the handler).
unsafe impl Send for GenerationHandler {}
// SAFETY: as above.
unsafe impl Sync for GenerationHandler {}

impl GenerationHandler {
    /// Create a handler at generation 0 with no observers.
    #[must_use]
    pub fn new() -> Self {
        let hold = Box::into_raw(Box::new(GenHold::new()));
        Self {
            current: AtomicU64::new(0),
            last: AtomicPtr::new(hold),
            inner: Mutex::new(HandlerInner {
                first: hold,
                free: Vec::new(),
            }),
        }
    }

    /// The generation currently being written.
    #[must_use]
    #[inline]
    pub fn current_generation(&self) -> u64 {
        self.current.load(READ_ORD)
    }

    /// Record the current generation as observed until the returned guard
    /// is dropped.
    ///
    /// Lock-free and cheap: one refcount increment plus a validation load,
    /// retried only if a bump lands in between.
    #[must_use]
    pub fn take_guard(&self) -> GenGuard<'_> {
        loop {
            let ptr = self.last.load(GUARD_ORD);
            // SAFETY: hold records are never deallocated while the handler
            // (which the guard borrows) is alive.
            let hold: &GenHold = unsafe { &*ptr };
            hold.refs.fetch_add(1, GUARD_ORD);
            if self.last.load(GUARD_ORD) == ptr {
                return GenGuard { hold };
            }
            // A bump moved `last` mid-acquisition; undo and retry on the
            // newer record.
            hold.refs.fetch_sub(1, GUARD_RELEASE_ORD);
        }
    }

    /// Advance to the next generation. Called by the writer once per freeze
    /// cycle. Returns the new current generation.
    pub fn bump(&self) -> u64 {
        let mut inner = self.inner.lock();
        let next_gen = self.current.load(RELAXED) + 1;

        let node_ptr = Self::reuse_or_alloc(&mut inner);
        // SAFETY: the record is off the active list with no guards; stale
        // transient increments only delay its next reuse.
        let node: &GenHold = unsafe { &*node_ptr };
        node.generation.store(next_gen, RELAXED);
        node.next.store(StdPtr::null_mut(), RELAXED);

        let prev = self.last.load(RELAXED);
        // SAFETY: `prev` is the live tail; writer-only under the lock.
        unsafe { &*prev }.next.store(node_ptr, RELAXED);
        self.last.store(node_ptr, GUARD_ORD);
        self.current.store(next_gen, WRITE_ORD);

        self.prune_locked(&mut inner);
        trace_log!(generation = next_gen, "generation bumped");
        next_gen
    }

    /// The oldest generation any live guard still observes, or the current
    /// generation if there are none.
    ///
    /// Reclamation driven by this value can never free storage an active
    /// reader might dereference.
    #[must_use]
    pub fn oldest_observed_generation(&self) -> u64 {
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner);
        // SAFETY: `first` is always a live record.
        unsafe { &*inner.first }.generation.load(RELAXED)
    }

    /// Number of live guards across all generations. Diagnostic only.
    #[must_use]
    pub fn guard_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut count = 0_usize;
        let mut cursor = inner.first;
        while !cursor.is_null() {
            // SAFETY: active-list records are live; traversal under lock.
            let node: &GenHold = unsafe { &*cursor };
            count += node.refs.load(GUARD_ORD) as usize;
            cursor = node.next.load(RELAXED);
        }
        count
    }

    fn reuse_or_alloc(inner: &mut HandlerInner) -> *mut GenHold {
        let reusable = inner
            .free
            .iter()
            .position(|&p| {
                // SAFETY: free-list records are live.
                unsafe { &*p }.refs.load(GUARD_ORD) == 0
            });
        match reusable {
            Some(idx) => inner.free.swap_remove(idx),
            None => Box::into_raw(Box::new(GenHold::new())),
        }
    }

    /// Move fully released records from the front of the active list onto
    /// the free list. The tail record is never pruned: it is the one readers
    /// are acquiring against.
    fn prune_locked(&self, inner: &mut HandlerInner) {
        let last = self.last.load(RELAXED);
        while inner.first != last {
            // SAFETY: active-list records are live; traversal under lock.
            let node: &GenHold = unsafe { &*inner.first };
            if node.refs.load(GUARD_ORD) != 0 {
                break;
            }
            let next = node.next.load(RELAXED);
            debug_assert!(!next.is_null(), "non-tail record without successor");
            inner.free.push(inner.first);
            inner.first = next;
        }
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GenerationHandler {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut cursor = inner.first;
        while !cursor.is_null() {
            // SAFETY: records are allocated via Box::into_raw and freed
            // exactly once; the active list and free list are disjoint.
            let boxed = unsafe { Box::from_raw(cursor) };
            debug_assert_eq!(boxed.refs.load(GUARD_ORD), 0, "guard outlived handler");
            cursor = boxed.next.load(RELAXED);
        }
        for &ptr in &inner.free {
            // SAFETY: as above.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl StdFmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("GenerationHandler")
            .field("current", &self.current_generation())
            .field("oldest_observed", &self.oldest_observed_generation())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  GenGuard
// ============================================================================

/// RAII token recording that a reader observes a generation.
///
/// While the guard is alive, no storage retired at or after its generation
/// may be reclaimed. Dropping it (on any exit path, including unwinding)
/// releases the observation.
#[must_use = "a generation guard protects reads only while it is alive"]
pub struct GenGuard<'a> {
    hold: &'a GenHold,
}

impl GenGuard<'_> {
    /// The generation this guard pins.
    #[must_use]
    #[inline]
    pub fn generation(&self) -> u64 {
        self.hold.generation.load(RELAXED)
    }
}

impl Drop for GenGuard<'_> {
    fn drop(&mut self) {
        self.hold.refs.fetch_sub(1, GUARD_RELEASE_ORD);
    }
}

impl StdFmt::Debug for GenGuard<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("GenGuard")
            .field("generation", &self.generation())
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================
