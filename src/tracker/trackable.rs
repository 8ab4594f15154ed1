//! Per-object capabilities
//!
//! `EdgeTarget` classifies a referent, `Trackable` is the mixin for native
//! objects taking part in walks, `TrackerTarget` is the native proxy of an
//! object living in the external heap.

use super::phase::{DiagnosticWalk, WalkPhase, Walker};
use super::state::TrackerState;
use crate::logging;

/// Anything a `TrackedEdge` can point at.
///
/// The defaults describe a plain reference-counted referent. Tracking-capable
/// objects return themselves from `as_trackable`, cross-runtime proxies from
/// `as_tracker_target`; an object may be both.
pub trait EdgeTarget: Send + Sync + 'static {
    fn as_trackable(&self) -> Option<&dyn Trackable> {
        None
    }

    fn as_tracker_target(&self) -> Option<&dyn TrackerTarget> {
        None
    }
}

/// Native object taking part in reference tracking
pub trait Trackable: EdgeTarget {
    fn tracker(&self) -> &TrackerState;

    /// Bytes held outside the native heap, reported by diagnostic walks
    fn external_memory_size(&self) -> usize {
        0
    }
}

/// Native proxy for an object owned by the external runtime.
///
/// Edges count their references separately through `add_ref_from_tracker`
/// and `release_from_tracker`. `peg`/`unpeg` are idempotent: the Peg walk
/// protects every target reachable from a pegged object, the next Unpeg walk
/// lifts that protection.
pub trait TrackerTarget: Send + Sync {
    fn add_ref_from_tracker(&self);
    fn release_from_tracker(&self);
    fn peg(&self);
    fn unpeg(&self);
}

impl dyn Trackable {
    /// Run one phase on this object, then forward to its registered edges.
    ///
    /// Returns `false` when the phase pruned the object and nothing was
    /// forwarded.
    pub fn walk(&self, walker: &mut Walker<'_>, is_root: bool) -> bool {
        let state = self.tracker();

        if !state.enter_phase(walker, is_root) {
            walker.counters_mut().pruned += 1;
            logging::log_walk_pruned(state.id(), walker.phase(), is_root);
            return false;
        }

        walker.counters_mut().visited += 1;

        if let WalkPhase::Diagnostic(kind) = walker.phase() {
            if kind == DiagnosticWalk::ExternalMemory {
                walker.counters_mut().external_bytes += self.external_memory_size();
            }
            if let Some(this) = state.this_weak() {
                walker.record_diagnostic_visit(this);
            }
        }

        state.edges().walk(walker);
        true
    }
}
