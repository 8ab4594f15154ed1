//! Typed tracked pointer
//!
//! A `TrackedEdge<T>` is one outgoing edge of the object graph. The slot is
//! a sum type over the referent's capabilities, so ownership actions and
//! walk forwarding are exhaustive matches rather than flag checks.
//!
//! While it holds a value the edge is registered with its owner's
//! `EdgeRegistry`; walks reach an object's edges only through that registry.

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::core::Core;
use super::lock::thread_token;
use super::peg::{PegGuard, PegPolicy};
use super::phase::{WalkPhase, Walker};
use super::refs::TrackedRef;
use super::state::TrackerState;
use super::trackable::{EdgeTarget, Trackable};
use super::TrackerId;
use crate::error::{Result, TrackerError};
use crate::fatal;

/// Capabilities of the referent, decided once at `set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Plain,
    /// Native proxy for an external object
    Target,
    /// Tracking-capable native object
    Tracker,
    Both,
}

enum EdgeSlot<T> {
    Empty,
    Plain(Arc<T>),
    Target(Arc<T>),
    Tracker(Arc<T>),
    Both(Arc<T>),
}

impl<T: EdgeTarget> EdgeSlot<T> {
    fn classify(value: Option<Arc<T>>) -> Self {
        let Some(value) = value else {
            return EdgeSlot::Empty;
        };

        match (value.as_trackable().is_some(), value.as_tracker_target().is_some()) {
            (false, false) => EdgeSlot::Plain(value),
            (false, true) => EdgeSlot::Target(value),
            (true, false) => EdgeSlot::Tracker(value),
            (true, true) => EdgeSlot::Both(value),
        }
    }

    fn value(&self) -> Option<&Arc<T>> {
        match self {
            EdgeSlot::Empty => None,
            EdgeSlot::Plain(v) | EdgeSlot::Target(v) | EdgeSlot::Tracker(v) | EdgeSlot::Both(v) => Some(v),
        }
    }

    fn kind(&self) -> Option<EdgeKind> {
        match self {
            EdgeSlot::Empty => None,
            EdgeSlot::Plain(_) => Some(EdgeKind::Plain),
            EdgeSlot::Target(_) => Some(EdgeKind::Target),
            EdgeSlot::Tracker(_) => Some(EdgeKind::Tracker),
            EdgeSlot::Both(_) => Some(EdgeKind::Both),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, EdgeSlot::Empty)
    }

    /// Ownership taken when the value enters the slot
    fn acquire(&self) {
        match self {
            EdgeSlot::Empty | EdgeSlot::Plain(_) => {}
            EdgeSlot::Target(v) => add_ref_target(&**v),
            EdgeSlot::Tracker(v) => add_ref_tracker(&**v),
            EdgeSlot::Both(v) => {
                add_ref_target(&**v);
                add_ref_tracker(&**v);
            }
        }
    }

    /// Inverse of `acquire`; callers hold no lock
    fn release(self) {
        match self {
            EdgeSlot::Empty | EdgeSlot::Plain(_) => {}
            EdgeSlot::Target(v) => release_target(&*v),
            EdgeSlot::Tracker(v) => release_tracker(&*v),
            EdgeSlot::Both(v) => {
                release_target(&*v);
                release_tracker(&*v);
            }
        }
    }
}

fn add_ref_target<T: EdgeTarget>(value: &T) {
    if let Some(target) = value.as_tracker_target() {
        target.add_ref_from_tracker();
    }
}

fn release_target<T: EdgeTarget>(value: &T) {
    if let Some(target) = value.as_tracker_target() {
        target.release_from_tracker();
    }
}

fn add_ref_tracker<T: EdgeTarget>(value: &T) {
    if let Some(object) = value.as_trackable() {
        let state = object.tracker();
        state.add_expected();
        state.clear_create_peg();
    }
}

fn release_tracker<T: EdgeTarget>(value: &T) {
    if let Some(object) = value.as_trackable() {
        object.tracker().release_expected();
    }
}

fn walk_target<T: EdgeTarget>(value: &T, walker: &mut Walker<'_>) {
    let Some(target) = value.as_tracker_target() else {
        return;
    };

    match walker.phase() {
        WalkPhase::Peg => target.peg(),
        WalkPhase::Unpeg => target.unpeg(),
        WalkPhase::Find => walker.report_target(target),
        WalkPhase::Reachable | WalkPhase::Diagnostic(_) | WalkPhase::Validate => {}
    }
}

fn walk_tracker<T: EdgeTarget>(value: &T, walker: &mut Walker<'_>) {
    if let Some(object) = value.as_trackable() {
        object.walk(walker, false);
    }
}

/// Walk-side view of an edge, type-erased for the owner's registry
pub(crate) trait EdgeWalk: Send + Sync {
    fn walk(&self, walker: &mut Walker<'_>);
    fn is_registered_with(&self, registry: &EdgeRegistry) -> bool;
}

struct EdgeCell<T: EdgeTarget> {
    owner: Weak<EdgeRegistry>,
    owner_id: TrackerId,
    slot: RwLock<EdgeSlot<T>>,
}

impl<T: EdgeTarget> EdgeWalk for EdgeCell<T> {
    fn walk(&self, walker: &mut Walker<'_>) {
        let slot = self.slot.read_recursive();
        match &*slot {
            EdgeSlot::Empty | EdgeSlot::Plain(_) => {}
            EdgeSlot::Target(v) => walk_target(&**v, walker),
            EdgeSlot::Tracker(v) => walk_tracker(&**v, walker),
            EdgeSlot::Both(v) => {
                walk_target(&**v, walker);
                walk_tracker(&**v, walker);
            }
        }
    }

    fn is_registered_with(&self, registry: &EdgeRegistry) -> bool {
        std::ptr::eq(self.owner.as_ptr(), registry) && !self.slot.read_recursive().is_empty()
    }
}

/// Edges an object currently holds values in
pub(crate) struct EdgeRegistry {
    owner: TrackerId,
    core: Arc<Core>,
    affinity: u64,
    destroying: AtomicBool,
    edges: Mutex<SmallVec<[Arc<dyn EdgeWalk>; 4]>>,
}

impl EdgeRegistry {
    pub(crate) fn new(owner: TrackerId, core: Arc<Core>, affinity: u64) -> Self {
        Self {
            owner,
            core,
            affinity,
            destroying: AtomicBool::new(false),
            edges: Mutex::new(SmallVec::new()),
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub(crate) fn mark_destroying(&self) {
        self.destroying.store(true, Ordering::Release);
    }

    pub(crate) fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.edges.lock().len()
    }

    fn register(&self, edge: Arc<dyn EdgeWalk>) {
        let mut edges = self.edges.lock();
        if edges.iter().any(|e| same_edge(e, &edge)) {
            fatal!("edge registered twice with {}", self.owner);
        }
        edges.push(edge);
    }

    fn unregister(&self, edge: &Arc<dyn EdgeWalk>) {
        self.edges.lock().retain(|e| !same_edge(e, edge));
    }

    /// Forward a walk to every registered edge. Validation walks check
    /// ownership instead of descending.
    pub(crate) fn walk(&self, walker: &mut Walker<'_>) {
        let edges: SmallVec<[Arc<dyn EdgeWalk>; 4]> = self.edges.lock().clone();

        for edge in &edges {
            if walker.phase() == WalkPhase::Validate {
                if !edge.is_registered_with(self) {
                    walker.counters_mut().invalid_edges += 1;
                }
                continue;
            }
            edge.walk(walker);
        }
    }
}

fn same_edge(a: &Arc<dyn EdgeWalk>, b: &Arc<dyn EdgeWalk>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}

pub struct TrackedEdge<T: EdgeTarget> {
    cell: Arc<EdgeCell<T>>,
}

impl<T: EdgeTarget> TrackedEdge<T> {
    /// Empty edge belonging to `owner`
    pub fn new(owner: &TrackerState) -> Self {
        Self {
            cell: Arc::new(EdgeCell {
                owner: Arc::downgrade(owner.edges()),
                owner_id: owner.id(),
                slot: RwLock::new(EdgeSlot::Empty),
            }),
        }
    }

    pub fn owner(&self) -> TrackerId {
        self.cell.owner_id
    }

    fn as_edge_walk(&self) -> Arc<dyn EdgeWalk> {
        self.cell.clone()
    }

    fn live_owner(&self, operation: &str) -> Arc<EdgeRegistry> {
        match self.cell.owner.upgrade() {
            Some(registry) if !registry.is_destroying() => registry,
            _ => fatal!(
                "{} on an edge of {} after its owner began destruction",
                operation,
                self.cell.owner_id
            ),
        }
    }

    /// Replace the referent. The new value's references are taken before
    /// the owner's core lock, the old value's are released after it.
    pub fn set(&self, value: Option<Arc<T>>) {
        let registry = self.live_owner("TrackedEdge::set");
        if registry.affinity != 0 && registry.affinity != thread_token() {
            fatal!("TrackedEdge::set on {} from a thread other than its owner", self.cell.owner_id);
        }

        let next = EdgeSlot::classify(value);
        next.acquire();
        let now_set = !next.is_empty();

        let previous = {
            let _guard = registry.core().lock();
            let previous = std::mem::replace(&mut *self.cell.slot.write(), next);
            match (previous.is_empty(), now_set) {
                (true, true) => registry.register(self.as_edge_walk()),
                (false, false) => registry.unregister(&self.as_edge_walk()),
                _ => {}
            }
            previous
        };

        previous.release();
    }

    pub fn clear(&self) {
        let previous = match self.cell.owner.upgrade() {
            Some(registry) => {
                let _guard = registry.core().lock();
                let previous = std::mem::replace(&mut *self.cell.slot.write(), EdgeSlot::Empty);
                if !previous.is_empty() {
                    registry.unregister(&self.as_edge_walk());
                }
                previous
            }
            // Owner already gone: nothing left to unregister from
            None => std::mem::replace(&mut *self.cell.slot.write(), EdgeSlot::Empty),
        };

        previous.release();
    }

    /// Untracked strong reference to the referent
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.slot.read().value().cloned()
    }

    pub fn kind(&self) -> Option<EdgeKind> {
        self.cell.slot.read().kind()
    }

    pub fn is_set(&self) -> bool {
        !self.cell.slot.read().is_empty()
    }

    pub fn points_to(&self, value: &Arc<T>) -> bool {
        self.cell
            .slot
            .read()
            .value()
            .map_or(false, |v| Arc::ptr_eq(v, value))
    }

    /// Whether the referent may be dereferenced now. Tracking-capable
    /// referents answer for themselves; other referents are safe whenever
    /// the owner's core is not mid-cycle.
    pub fn is_value_safe_to_use(&self) -> bool {
        let slot = self.cell.slot.read();
        match &*slot {
            EdgeSlot::Empty => true,
            EdgeSlot::Tracker(v) | EdgeSlot::Both(v) => v
                .as_trackable()
                .map_or(true, |object| object.tracker().is_value_safe_to_use()),
            EdgeSlot::Plain(_) | EdgeSlot::Target(_) => self
                .cell
                .owner
                .upgrade()
                .map_or(false, |registry| !registry.core().is_in_cycle()),
        }
    }

    pub fn try_get_safe(&self) -> Result<Option<Arc<T>>> {
        if !self.is_value_safe_to_use() {
            return Err(TrackerError::UnsafeValue(self.cell.owner_id));
        }
        Ok(self.get())
    }
}

impl<T: Trackable> TrackedEdge<T> {
    pub fn set_ref(&self, value: &TrackedRef<T>) {
        self.set(Some(Arc::clone(value.as_arc())));
    }

    pub fn get_ref(&self) -> Option<TrackedRef<T>> {
        self.get().map(TrackedRef::adopt)
    }

    /// Guard that pegs the referent only while it is still reachable
    pub fn try_make_peg_guard(&self) -> PegGuard<T> {
        PegGuard::new(self.get(), PegPolicy::IfReachable)
    }
}

impl<T: EdgeTarget> Drop for TrackedEdge<T> {
    fn drop(&mut self) {
        if self.cell.slot.read().is_empty() {
            return;
        }
        self.clear();
    }
}

/// Identity of the referent; the kind tag is ignored
impl<T: EdgeTarget> PartialEq for TrackedEdge<T> {
    fn eq(&self, other: &Self) -> bool {
        let lhs = self.cell.slot.read().value().map(Arc::as_ptr);
        let rhs = other.cell.slot.read().value().map(Arc::as_ptr);
        lhs == rhs
    }
}

impl<T: EdgeTarget> fmt::Debug for TrackedEdge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedEdge")
            .field("owner", &self.cell.owner_id)
            .field("kind", &self.kind())
            .finish()
    }
}
