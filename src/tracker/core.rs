//! Runtime instances ("cores")
//!
//! A core owns a reentrant lock and a peer table of every object tracked
//! through it. Native code enters the lock around graph mutation; the
//! coordinator holds it for the whole of a cycle.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::coordinator::TrackingCoordinator;
use super::lock::{ReentrantGuard, ReentrantLock};
use super::phase::{WalkPhase, Walker};
use super::refs::{TrackedRef, WalkPin};
use super::trackable::Trackable;
use super::{CoreId, TrackerId};
use crate::{fatal, logging};

/// Per-core position in the cycle. Only `Idle` survives a cycle bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreWalkState {
    Idle,
    Unpegging,
    Pegging,
    AwaitingDiscovery,
    ComputingReachability,
}

/// Protection applied when an object is tracked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Protect until an edge or tracker source references the object
    pub create_peg: bool,
    pub peg_no_ref: bool,
}

pub struct Core {
    id: CoreId,
    name: String,
    coordinator: Arc<TrackingCoordinator>,
    lock: ReentrantLock,
    peers: DashMap<TrackerId, Weak<dyn Trackable>>,
    /// Objects pinned by the core itself ("pegged by core table")
    gc_roots: DashMap<TrackerId, Arc<dyn Trackable>>,
    walk_state: Mutex<CoreWalkState>,
    active: AtomicBool,
    registered: AtomicBool,
}

impl Core {
    /// Unregistered core bound to `coordinator`
    pub fn new(coordinator: &Arc<TrackingCoordinator>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: coordinator.next_core_id(),
            name: name.into(),
            coordinator: Arc::clone(coordinator),
            lock: ReentrantLock::new(),
            peers: DashMap::new(),
            gc_roots: DashMap::new(),
            walk_state: Mutex::new(CoreWalkState::Idle),
            active: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &Arc<TrackingCoordinator> {
        &self.coordinator
    }

    /// Enter the core's reentrant lock
    pub fn lock(&self) -> ReentrantGuard<'_> {
        self.lock.lock()
    }

    /// Nested entries held by the calling thread
    pub fn enter_count(&self) -> usize {
        self.lock.enter_count()
    }

    pub(crate) fn raw_lock(&self) -> &ReentrantLock {
        &self.lock
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    pub fn walk_state(&self) -> CoreWalkState {
        *self.walk_state.lock()
    }

    pub(crate) fn set_walk_state(&self, state: CoreWalkState) {
        *self.walk_state.lock() = state;
    }

    pub fn is_in_cycle(&self) -> bool {
        self.walk_state() != CoreWalkState::Idle
    }

    /// Left out of the running cycle: its lock is not held, so cycle walks
    /// must not touch its objects
    pub(crate) fn is_frozen(&self) -> bool {
        self.coordinator.is_in_cycle() && !self.is_in_cycle()
    }

    // ------------------------------------------------------------------
    // Peer table
    // ------------------------------------------------------------------

    /// Move `value` to the heap and add it to the peer table
    pub fn track<T: Trackable>(&self, value: T) -> TrackedRef<T> {
        self.track_with(value, CreateOptions::default())
    }

    pub fn track_with<T: Trackable>(&self, value: T, options: CreateOptions) -> TrackedRef<T> {
        if !std::ptr::eq(Arc::as_ptr(value.tracker().core()), self) {
            fatal!(
                "object {} was created for another core than {}",
                value.tracker().id(),
                self.id
            );
        }

        let object = Arc::new(value);
        let weak: Weak<T> = Arc::downgrade(&object);
        let weak: Weak<dyn Trackable> = weak;
        let state = object.tracker();
        let id = state.id();

        if !state.attach(Weak::clone(&weak)) {
            fatal!("object {} tracked twice", id);
        }

        if options.create_peg {
            state.set_create_peg();
        }
        if options.peg_no_ref {
            state.peg_no_ref(!options.create_peg);
        }

        {
            let _guard = self.lock();
            self.peers.insert(id, weak);
        }

        tracing::trace!(target: "reftrack::walk", core = %self.id, object = %id, "tracked");
        TrackedRef::adopt(object)
    }

    pub(crate) fn remove_peer(&self, id: TrackerId) {
        self.peers.remove(&id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: TrackerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Pin every live peer for a walk. Peers mid-destruction are skipped.
    pub(crate) fn snapshot(&self) -> Vec<WalkPin> {
        self.peers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .map(WalkPin::new)
            .collect()
    }

    // ------------------------------------------------------------------
    // Core table roots
    // ------------------------------------------------------------------

    /// Keep `object` alive and pegged from this core's own table
    pub fn add_gc_root<T: Trackable>(&self, object: &TrackedRef<T>) {
        let _guard = self.lock();
        let id = object.id();
        if self.gc_roots.contains_key(&id) {
            return;
        }

        let strong: Arc<dyn Trackable> = object.to_arc();
        strong.tracker().add_expected();
        strong.tracker().set_pegged_by_core_table();
        self.gc_roots.insert(id, strong);
    }

    pub fn remove_gc_root(&self, id: TrackerId) -> bool {
        let removed = {
            let _guard = self.lock();
            self.gc_roots.remove(&id)
        };

        match removed {
            Some((_, object)) => {
                object.tracker().release_expected();
                true
            }
            None => false,
        }
    }

    pub fn gc_root_count(&self) -> usize {
        self.gc_roots.len()
    }

    pub(crate) fn flag_core_table_roots(&self) {
        for entry in self.gc_roots.iter() {
            entry.value().tracker().set_pegged_by_core_table();
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Root-only validation walk over every peer. Returns the number of
    /// registered edges that do not name their owner.
    pub fn validate_peers(&self) -> usize {
        let _guard = self.lock();
        let pins = self.snapshot();

        let mut walker = Walker::new(WalkPhase::Validate);
        for pin in &pins {
            pin.walk(&mut walker, true);
        }
        walker.counters().invalid_edges
    }

    /// Drop every peer: protections are lifted, weak links cut and the
    /// peer table emptied, after which the core may be unregistered.
    pub fn shutdown_all_peers(&self) -> usize {
        let mut released: Vec<Arc<dyn Trackable>> = Vec::new();

        let count = {
            let _guard = self.lock();
            let pins = self.snapshot();

            for pin in &pins {
                let state = pin.tracker();
                state.disconnect_weak_link();
                if let Some(strong) = state.clear_all_pegs() {
                    released.push(strong);
                }
            }

            let root_ids: Vec<TrackerId> = self.gc_roots.iter().map(|entry| *entry.key()).collect();
            for id in root_ids {
                if let Some((_, object)) = self.gc_roots.remove(&id) {
                    object.tracker().release_expected();
                    released.push(object);
                }
            }

            self.peers.clear();
            pins.len()
        };

        drop(released);

        if let Some(host) = self.coordinator.host() {
            host.notify_end_of_reference_tracking_on_thread();
        }

        logging::log_core_lifecycle(self.id, "shutdown", count);
        count
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peers", &self.peer_count())
            .field("state", &self.walk_state())
            .field("active", &self.is_active())
            .finish()
    }
}
