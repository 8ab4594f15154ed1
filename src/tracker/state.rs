//! Per-object tracking state embedded in every `Trackable`
//!
//! Holds the peg bookkeeping, the reachability bits, expected vs actual
//! reference counts, tracker-source counts and the registry of outgoing
//! edges. Flag and peg mutations made by walks happen under the owning
//! core's lock.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::core::Core;
use super::edge::EdgeRegistry;
use super::external::HandleTable;
use super::lock::thread_token;
use super::phase::{WalkPhase, Walker};
use super::refs::WeakLink;
use super::trackable::Trackable;
use super::TrackerId;
use crate::error::{Result, TrackerError};
use crate::{fatal, logging};

mod flags {
    pub const REACHABLE: u32 = 1 << 0;
    pub const PEG_WALKED: u32 = 1 << 1;
    pub const DIAG_WALKED: u32 = 1 << 2;
    /// Reachable at the end of the previous cycle; read by the Unpeg walk
    pub const WAS_REACHABLE: u32 = 1 << 3;
    pub const CREATE_PEG: u32 = 1 << 4;
    pub const NO_REF_PEG: u32 = 1 << 5;
    pub const IMPLICIT_PEG: u32 = 1 << 6;
    pub const CORE_TABLE_PEG: u32 = 1 << 7;

    pub const WALK_BITS: u32 = REACHABLE | PEG_WALKED | DIAG_WALKED | WAS_REACHABLE;
    pub const FLAG_PEGS: u32 = CREATE_PEG | NO_REF_PEG | CORE_TABLE_PEG;
}

use flags::*;

pub const MAX_PEG_COUNT: u32 = u16::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCountKind {
    /// Strong references that exist, excluding transient walk pins
    Actual,
    /// References the graph accounts for: edges, tracked handles, pegs,
    /// tracker sources and core roots
    Expected,
}

/// Counted self-reference: the first entry takes a strong reference to the
/// object, the last exit hands it back for release.
struct SelfHold {
    count: u32,
    strong: Option<Arc<dyn Trackable>>,
}

impl SelfHold {
    const fn new() -> Self {
        Self { count: 0, strong: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrackingOutcome {
    pub reachable: bool,
    /// The weak link was disconnected by this call
    pub disconnected: bool,
}

pub struct TrackerState {
    id: TrackerId,
    core: Arc<Core>,
    this: OnceCell<Weak<dyn Trackable>>,
    /// Thread token of the owning thread, 0 when free-threaded
    affinity: u64,
    flags: AtomicU32,
    last_find_walk_id: AtomicU32,
    expected_refs: AtomicUsize,
    walk_pins: AtomicUsize,
    peg_count: AtomicU32,
    pegs: Mutex<SelfHold>,
    source_refs: AtomicU32,
    sources: Mutex<SelfHold>,
    source_connections: AtomicUsize,
    edges: Arc<EdgeRegistry>,
    weak_link: Mutex<Arc<WeakLink>>,
    pub(crate) handles: Mutex<HandleTable>,
}

impl TrackerState {
    pub fn new(core: &Arc<Core>) -> Self {
        let id = TrackerId::next();
        let affinity = if core.coordinator().config().thread_affinity {
            thread_token()
        } else {
            0
        };

        Self {
            id,
            core: Arc::clone(core),
            this: OnceCell::new(),
            affinity,
            // New objects are not garbage until a cycle says so
            flags: AtomicU32::new(REACHABLE),
            last_find_walk_id: AtomicU32::new(0),
            expected_refs: AtomicUsize::new(0),
            walk_pins: AtomicUsize::new(0),
            peg_count: AtomicU32::new(0),
            pegs: Mutex::new(SelfHold::new()),
            source_refs: AtomicU32::new(0),
            sources: Mutex::new(SelfHold::new()),
            source_connections: AtomicUsize::new(0),
            edges: Arc::new(EdgeRegistry::new(id, Arc::clone(core), affinity)),
            weak_link: Mutex::new(Arc::new(WeakLink::new())),
            handles: Mutex::new(HandleTable::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub(crate) fn edges(&self) -> &Arc<EdgeRegistry> {
        &self.edges
    }

    /// Edges currently holding a value
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Bind the state to the allocation that contains it. Only the first
    /// call has an effect.
    pub(crate) fn attach(&self, this: Weak<dyn Trackable>) -> bool {
        self.this.set(this).is_ok()
    }

    pub fn is_tracked(&self) -> bool {
        self.this.get().is_some()
    }

    pub(crate) fn this_weak(&self) -> Option<Weak<dyn Trackable>> {
        self.this.get().cloned()
    }

    fn this(&self) -> Option<Arc<dyn Trackable>> {
        self.this.get().and_then(Weak::upgrade)
    }

    #[inline]
    fn has(&self, mask: u32) -> bool {
        self.flags.load(Ordering::Acquire) & mask != 0
    }

    #[inline]
    fn set_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_or(mask, Ordering::AcqRel)
    }

    #[inline]
    fn clear_flags(&self, mask: u32) -> u32 {
        self.flags.fetch_and(!mask, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------
    // Walk protocol
    // ------------------------------------------------------------------

    /// Reset per-cycle walk state, remembering whether the object survived
    /// the previous cycle.
    pub fn prepare_for_walk(&self) {
        let _ = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
            let mut next = f & !WALK_BITS;
            if f & REACHABLE != 0 {
                next |= WAS_REACHABLE;
            }
            Some(next)
        });
        self.last_find_walk_id.store(0, Ordering::Release);
    }

    /// Phase policy. Returns `false` when the walk is pruned at this object.
    pub(crate) fn enter_phase(&self, walker: &mut Walker<'_>, is_root: bool) -> bool {
        if walker.phase().is_cycle_walk() && self.core.is_frozen() {
            return false;
        }

        match walker.phase() {
            WalkPhase::Unpeg => {
                if !is_root || !self.has(WAS_REACHABLE) {
                    return false;
                }
                self.clear_flags(IMPLICIT_PEG | CORE_TABLE_PEG);
                true
            }
            WalkPhase::Peg => {
                if self.has(PEG_WALKED) {
                    return false;
                }
                if is_root && !self.is_pegged(false) {
                    if walker.implicit_peg_enabled() {
                        self.try_implicit_peg(walker);
                    }
                    if !self.is_pegged(false) {
                        return false;
                    }
                }
                self.set_flags(PEG_WALKED | REACHABLE);
                true
            }
            WalkPhase::Find => {
                let id = walker.find_walk_id();
                if self.last_find_walk_id.swap(id, Ordering::AcqRel) == id {
                    return false;
                }
                !self.has(PEG_WALKED)
            }
            WalkPhase::Reachable => self.set_flags(REACHABLE) & REACHABLE == 0,
            WalkPhase::Diagnostic(_) => self.set_flags(DIAG_WALKED) & DIAG_WALKED == 0,
            WalkPhase::Validate => is_root,
        }
    }

    /// Something outside the graph holds a reference: keep the object for
    /// this cycle. Compared under the core lock held by the Peg walk.
    fn try_implicit_peg(&self, walker: &mut Walker<'_>) {
        let expected = self.ref_count(RefCountKind::Expected);
        let actual = self.ref_count(RefCountKind::Actual);

        if actual > 0 && expected < actual {
            self.set_flags(IMPLICIT_PEG);
            walker.counters_mut().implicit_pegs += 1;
            logging::log_implicit_peg(self.id, expected, actual);
        }
    }

    pub(crate) fn clear_diagnostic_walked(&self) {
        self.clear_flags(DIAG_WALKED);
    }

    pub(crate) fn reset_find_walk_id(&self) {
        self.last_find_walk_id.store(0, Ordering::Release);
    }

    pub(crate) fn set_pegged_by_core_table(&self) {
        self.set_flags(CORE_TABLE_PEG);
    }

    /// Close out a cycle for this object. Unreachable objects lose their
    /// weak link so they cannot be resolved again.
    pub(crate) fn on_tracking_processed(&self) -> TrackingOutcome {
        self.last_find_walk_id.store(0, Ordering::Release);

        if self.is_reachable() {
            return TrackingOutcome {
                reachable: true,
                disconnected: false,
            };
        }

        let disconnected = self.disconnect_weak_link();
        TrackingOutcome {
            reachable: false,
            disconnected,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_reachable(&self) -> bool {
        self.has(REACHABLE)
    }

    /// With `by_count`, only counted pegs (explicit or implicit) qualify;
    /// otherwise any form of protection does.
    pub fn is_pegged(&self, by_count: bool) -> bool {
        let count_pegged = self.peg_count.load(Ordering::Acquire) > 0 || self.has(IMPLICIT_PEG);
        if by_count {
            count_pegged
        } else {
            count_pegged || self.has(FLAG_PEGS)
        }
    }

    /// Only meaningful for Peg, Find and diagnostic walks.
    pub fn has_been_walked(&self, phase: WalkPhase) -> bool {
        match phase {
            WalkPhase::Peg => self.has(PEG_WALKED),
            WalkPhase::Find => {
                let current = self.core.coordinator().current_find_walk_id();
                current != 0 && self.last_find_walk_id.load(Ordering::Acquire) == current
            }
            WalkPhase::Diagnostic(_) => self.has(DIAG_WALKED),
            WalkPhase::Unpeg | WalkPhase::Reachable | WalkPhase::Validate => {
                fatal!("has_been_walked is not tracked for {:?} walks", phase)
            }
        }
    }

    pub fn peg_count(&self) -> u32 {
        self.peg_count.load(Ordering::Acquire)
    }

    pub fn has_create_peg(&self) -> bool {
        self.has(CREATE_PEG)
    }

    pub fn is_pegged_no_ref(&self) -> bool {
        self.has(NO_REF_PEG)
    }

    pub fn is_implicitly_pegged(&self) -> bool {
        self.has(IMPLICIT_PEG)
    }

    pub fn is_pegged_by_core_table(&self) -> bool {
        self.has(CORE_TABLE_PEG)
    }

    pub fn ref_count(&self, kind: RefCountKind) -> usize {
        match kind {
            RefCountKind::Expected => self.expected_refs.load(Ordering::Acquire),
            RefCountKind::Actual => {
                let strong = self.this.get().map(Weak::strong_count).unwrap_or(0);
                strong.saturating_sub(self.walk_pins.load(Ordering::Acquire))
            }
        }
    }

    /// Safe to dereference outside a cycle, or while reachable inside one
    pub fn is_value_safe_to_use(&self) -> bool {
        !self.core.is_in_cycle() || self.is_reachable()
    }

    pub(crate) fn add_expected(&self) {
        self.expected_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_expected(&self) {
        let released = self
            .expected_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            fatal!("expected reference count underflow on {}", self.id);
        }
    }

    pub(crate) fn pin_for_walk(&self) {
        self.walk_pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin_for_walk(&self) {
        self.walk_pins.fetch_sub(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Pegs
    // ------------------------------------------------------------------

    /// Counted peg. 0 -> 1 takes a strong reference to the object, 1 -> 0
    /// gives it back.
    pub fn update_peg(&self, peg: bool) {
        self.assert_thread("update_peg");

        let released = {
            let _guard = self.core.lock();
            let mut hold = self.pegs.lock();

            if peg {
                if hold.count >= MAX_PEG_COUNT {
                    fatal!("peg count overflow on {}", self.id);
                }
                if hold.count == 0 {
                    let Some(this) = self.this() else {
                        fatal!("peg on {} which is not tracked or is being destroyed", self.id);
                    };
                    self.add_expected();
                    hold.strong = Some(this);
                }
                hold.count += 1;
                self.peg_count.store(hold.count, Ordering::Release);
                None
            } else {
                if hold.count == 0 {
                    fatal!("unpeg without a matching peg on {}", self.id);
                }
                hold.count -= 1;
                self.peg_count.store(hold.count, Ordering::Release);
                if hold.count == 0 {
                    hold.strong.take()
                } else {
                    None
                }
            }
        };

        if let Some(this) = released {
            self.release_expected();
            drop(this);

            let coordinator = self.core.coordinator();
            if coordinator.config().peer_stress {
                coordinator.trigger_collection();
            }
        }
    }

    /// Boolean peg that takes no reference. Lifts the create-time peg
    /// unless `clear_create_peg` is false.
    pub fn peg_no_ref(&self, clear_create_peg: bool) {
        let _guard = self.core.lock();
        self.set_flags(NO_REF_PEG);
        if clear_create_peg {
            self.clear_flags(CREATE_PEG);
        }
    }

    pub fn unpeg_no_ref(&self) {
        let _guard = self.core.lock();
        self.clear_flags(NO_REF_PEG | CREATE_PEG);
    }

    /// Protection for an object that is not yet reachable through the graph
    pub fn set_create_peg(&self) {
        let _guard = self.core.lock();
        self.set_flags(CREATE_PEG);
    }

    pub fn clear_create_peg(&self) {
        self.clear_flags(CREATE_PEG);
    }

    /// Drop every protection. Used when a core shuts down its peers; the
    /// returned reference must be released after the core lock is left.
    pub(crate) fn clear_all_pegs(&self) -> Option<Arc<dyn Trackable>> {
        self.clear_flags(FLAG_PEGS | IMPLICIT_PEG);

        let mut hold = self.pegs.lock();
        hold.count = 0;
        self.peg_count.store(0, Ordering::Release);
        let released = hold.strong.take();
        if released.is_some() {
            self.release_expected();
        }
        released
    }

    // ------------------------------------------------------------------
    // Tracker sources
    // ------------------------------------------------------------------

    /// A tracker source took a reference. The first one keeps the object
    /// alive until the last one is released.
    pub fn add_ref_from_tracker_source(&self) {
        let mut hold = self.sources.lock();
        if hold.count == 0 {
            let Some(this) = self.this() else {
                fatal!("tracker source reference on untracked object {}", self.id);
            };
            self.add_expected();
            hold.strong = Some(this);
        }
        hold.count += 1;
        self.source_refs.store(hold.count, Ordering::Release);
        self.clear_create_peg();
    }

    pub fn release_from_tracker_source(&self) {
        let released = {
            let mut hold = self.sources.lock();
            if hold.count == 0 {
                fatal!("tracker source release without a matching reference on {}", self.id);
            }
            hold.count -= 1;
            self.source_refs.store(hold.count, Ordering::Release);
            if hold.count == 0 {
                hold.strong.take()
            } else {
                None
            }
        };

        if let Some(this) = released {
            self.release_expected();
            drop(this);
        }
    }

    pub fn tracker_source_ref_count(&self) -> u32 {
        self.source_refs.load(Ordering::Acquire)
    }

    /// A live edge from the external heap now points here
    pub fn connect_from_tracker_source(&self) {
        self.source_connections.fetch_add(1, Ordering::AcqRel);
        self.clear_create_peg();
    }

    pub fn disconnect_from_tracker_source(&self) {
        let previous = self
            .source_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.reset_find_walk_id(),
            Ok(_) => {}
            Err(_) => fatal!("disconnect from tracker source without a connection on {}", self.id),
        }
    }

    pub fn is_referenced_by_tracker_source(&self) -> bool {
        self.source_connections.load(Ordering::Acquire) > 0
    }

    // ------------------------------------------------------------------
    // Weak references
    // ------------------------------------------------------------------

    pub(crate) fn weak_link(&self) -> Arc<WeakLink> {
        Arc::clone(&self.weak_link.lock())
    }

    pub(crate) fn disconnect_weak_link(&self) -> bool {
        self.weak_link.lock().disconnect()
    }

    pub fn is_weak_disconnected(&self) -> bool {
        !self.weak_link.lock().is_connected()
    }

    /// Reconnect an object whose weak link was cut. Weak references taken
    /// before the cut stay dead.
    pub fn resurrect(&self) -> bool {
        let mut link = self.weak_link.lock();
        if link.is_connected() {
            return false;
        }

        *link = Arc::new(WeakLink::new());
        self.set_flags(REACHABLE);
        true
    }

    // ------------------------------------------------------------------
    // Threading
    // ------------------------------------------------------------------

    pub fn check_thread(&self) -> Result<()> {
        if self.affinity != 0 && self.affinity != thread_token() {
            return Err(TrackerError::WrongThread(self.id));
        }
        Ok(())
    }

    pub(crate) fn assert_thread(&self, operation: &str) {
        if self.check_thread().is_err() {
            fatal!("{} on {} from a thread other than its owner", operation, self.id);
        }
    }
}

impl Drop for TrackerState {
    fn drop(&mut self) {
        self.edges.mark_destroying();

        if self.is_tracked() {
            let _guard = self.core.lock();
            self.core.remove_peer(self.id);
        }
    }
}

impl std::fmt::Debug for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerState")
            .field("id", &self.id)
            .field("core", &self.core.id())
            .field("flags", &format_args!("{:#010b}", self.flags.load(Ordering::Relaxed)))
            .field("peg_count", &self.peg_count())
            .field("expected", &self.ref_count(RefCountKind::Expected))
            .finish()
    }
}
