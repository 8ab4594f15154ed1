//! Shared fixtures for integration tests

#![allow(dead_code)]

use reftrack::{Core, EdgeTarget, Trackable, TrackedEdge, TrackerConfig, TrackerState, TrackerTarget, TrackingCoordinator};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const CHILD_SLOTS: usize = 3;

/// Native object with a few child edges and one external proxy edge
pub struct Widget {
    state: TrackerState,
    pub children: Vec<TrackedEdge<Widget>>,
    pub proxy: TrackedEdge<FakeProxy>,
}

impl Widget {
    pub fn new(core: &Arc<Core>) -> Self {
        let state = TrackerState::new(core);
        let children = (0..CHILD_SLOTS).map(|_| TrackedEdge::new(&state)).collect();
        let proxy = TrackedEdge::new(&state);
        Self { state, children, proxy }
    }

    pub fn clear_edges(&self) {
        for child in &self.children {
            child.clear();
        }
        self.proxy.clear();
    }
}

impl EdgeTarget for Widget {
    fn as_trackable(&self) -> Option<&dyn Trackable> {
        Some(self)
    }
}

impl Trackable for Widget {
    fn tracker(&self) -> &TrackerState {
        &self.state
    }
}

/// Stand-in for an object owned by the external collector
#[derive(Default)]
pub struct FakeProxy {
    pub tracker_refs: AtomicUsize,
    pub pegged: AtomicBool,
}

impl FakeProxy {
    pub fn is_pegged(&self) -> bool {
        self.pegged.load(Ordering::SeqCst)
    }

    pub fn refs(&self) -> usize {
        self.tracker_refs.load(Ordering::SeqCst)
    }
}

impl EdgeTarget for FakeProxy {
    fn as_tracker_target(&self) -> Option<&dyn TrackerTarget> {
        Some(self)
    }
}

impl TrackerTarget for FakeProxy {
    fn add_ref_from_tracker(&self) {
        self.tracker_refs.fetch_add(1, Ordering::SeqCst);
    }

    fn release_from_tracker(&self) {
        self.tracker_refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn peg(&self) {
        self.pegged.store(true, Ordering::SeqCst);
    }

    fn unpeg(&self) {
        self.pegged.store(false, Ordering::SeqCst);
    }
}

pub fn setup() -> (Arc<TrackingCoordinator>, Arc<Core>) {
    setup_with(TrackerConfig::default())
}

pub fn setup_with(config: TrackerConfig) -> (Arc<TrackingCoordinator>, Arc<Core>) {
    let coordinator = TrackingCoordinator::new(config);
    let core = coordinator.create_core("integration");
    (coordinator, core)
}

pub fn ignore_targets(_: reftrack::TrackerId, _: &dyn TrackerTarget) {}
