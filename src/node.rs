//! Node lifecycle state machine.
//!
//! Every node moves through the same four states:
//!
//! ```text
//! Reclaimed --alloc--> Mutable --freeze--> Frozen --thaw/hold--> Held --trim--> Reclaimed
//!                          \------------------------free-----------------------^
//! ```
//!
//! - **Mutable**: owned exclusively by the in-flight writer mutation, not yet
//!   reachable from any published snapshot.
//! - **Frozen**: immutable, reachable from the live tree and possibly from
//!   reader snapshots.
//! - **Held**: superseded by a newer copy; unreachable from any current or
//!   future root, but a past reader guard may still be walking it.
//! - **Reclaimed**: slot storage is free (on the arena free list or never
//!   allocated).
//!
//! All transitions funnel through [`StateCell::transition`] so that an
//! illegal transition is a single debug-assert away from being caught. The
//! cell is atomic only so that reader-side debug assertions may inspect it;
//! snapshot publication is ordered by the frozen-root store, not by this
//! field.

use std::fmt as StdFmt;
use std::sync::atomic::AtomicU8;

use crate::ordering::STATE_ORD;

/// Lifecycle state of a node slot.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Writer-private, not yet visible to readers.
    Mutable = 0,

    /// Immutable and reader-visible.
    Frozen = 1,

    /// Superseded; retained only for in-flight readers.
    Held = 2,

    /// Storage is free.
    Reclaimed = 3,
}

impl NodeState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Mutable,
            1 => Self::Frozen,
            2 => Self::Held,
            _ => Self::Reclaimed,
        }
    }

    /// Whether `from -> to` is a legal lifecycle transition.
    #[must_use]
    pub const fn is_legal_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Reclaimed, Self::Mutable)      // alloc
                | (Self::Mutable, Self::Frozen)   // freeze
                | (Self::Frozen, Self::Held)      // thaw / hold
                | (Self::Held, Self::Reclaimed)   // trim
                | (Self::Mutable, Self::Reclaimed) // free of a never-published node
        )
    }
}

/// Atomic cell holding a [`NodeState`].
///
/// Embedded at the head of every node. Stores use relaxed ordering: the
/// freeze-time flips are made visible to readers by the release store of the
/// frozen root, and every other transition is writer-private.
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in the given state.
    #[must_use]
    pub fn new(state: NodeState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Read the current state.
    #[must_use]
    #[inline(always)]
    pub fn load(&self) -> NodeState {
        NodeState::from_u8(self.0.load(STATE_ORD))
    }

    /// Transition from `expected` to `next`.
    ///
    /// # Panics
    /// Debug-asserts that the current state equals `expected` and that the
    /// transition is legal. A failed assertion here means the alloc / thaw /
    /// hold / freeze / trim protocol was violated by the caller.
    #[inline]
    pub fn transition(&self, expected: NodeState, next: NodeState) {
        debug_assert_eq!(
            self.load(),
            expected,
            "node state transition from unexpected state"
        );
        debug_assert!(
            NodeState::is_legal_transition(expected, next),
            "illegal node state transition {expected:?} -> {next:?}"
        );
        self.0.store(next as u8, STATE_ORD);
    }
}

impl StdFmt::Debug for StateCell {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "{:?}", self.load())
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(NodeState::Reclaimed)
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_roundtrip() {
        let cell = StateCell::default();
        assert_eq!(cell.load(), NodeState::Reclaimed);

        cell.transition(NodeState::Reclaimed, NodeState::Mutable);
        cell.transition(NodeState::Mutable, NodeState::Frozen);
        cell.transition(NodeState::Frozen, NodeState::Held);
        cell.transition(NodeState::Held, NodeState::Reclaimed);
        assert_eq!(cell.load(), NodeState::Reclaimed);
    }

    #[test]
    fn test_free_of_unpublished_node() {
        let cell = StateCell::new(NodeState::Mutable);
        cell.transition(NodeState::Mutable, NodeState::Reclaimed);
        assert_eq!(cell.load(), NodeState::Reclaimed);
    }

    #[test]
    fn test_legality_table() {
        use NodeState::{Frozen, Held, Mutable, Reclaimed};
        assert!(NodeState::is_legal_transition(Reclaimed, Mutable));
        assert!(NodeState::is_legal_transition(Mutable, Frozen));
        assert!(NodeState::is_legal_transition(Frozen, Held));
        assert!(NodeState::is_legal_transition(Held, Reclaimed));
        assert!(NodeState::is_legal_transition(Mutable, Reclaimed));

        assert!(!NodeState::is_legal_transition(Frozen, Mutable));
        assert!(!NodeState::is_legal_transition(Held, Frozen));
        assert!(!NodeState::is_legal_transition(Reclaimed, Frozen));
        assert!(!NodeState::is_legal_transition(Frozen, Reclaimed));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal node state transition")]
    fn test_illegal_transition_panics() {
        let cell = StateCell::new(NodeState::Frozen);
        cell.transition(NodeState::Frozen, NodeState::Mutable);
    }
}
