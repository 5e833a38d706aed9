//! Standard memory orderings for cross-thread publication.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reader loads of published state (frozen root, buffer table).
/// Pairs with the writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writer stores that publish state to readers.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for node state flags.
///
/// Relaxed on purpose: state flips are writer bookkeeping, sequenced before
/// the frozen-root Release store that actually publishes a snapshot.
pub const STATE_ORD: Ordering = Ordering::Relaxed;

/// Ordering for the guard-acquisition / generation-bump handshake.
///
/// Guard take (reader: increment then validate) and bump (writer: publish
/// then scan) form a store-load race in both directions; anything weaker
/// than SeqCst lets both sides miss each other's store.
pub const GUARD_ORD: Ordering = Ordering::SeqCst;

/// Ordering for guard release.
/// Makes the reader's node accesses visible before the writer can reuse them.
pub const GUARD_RELEASE_ORD: Ordering = Ordering::Release;

/// Ordering for relaxed counters.
pub const RELAXED: Ordering = Ordering::Relaxed;
