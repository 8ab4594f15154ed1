//! Walk phases and the per-walk context

use std::sync::Weak;

use super::trackable::{Trackable, TrackerTarget};
use super::TrackerId;

/// Closed set of walk phases. Every component dispatches on this with one
/// exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkPhase {
    /// Drop protections granted in the previous cycle
    Unpeg,
    /// Re-derive which objects must survive this cycle
    Peg,
    /// Report cross-runtime edges from unprotected sources
    Find,
    /// Compute final survivorship
    Reachable,
    Diagnostic(DiagnosticWalk),
    /// Root-only check that every registered edge names its owner
    Validate,
}

impl WalkPhase {
    /// Phases run by the coordinator inside a cycle bracket
    pub fn is_cycle_walk(self) -> bool {
        matches!(self, Self::Unpeg | Self::Peg | Self::Find | Self::Reachable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticWalk {
    ObjectCount,
    ExternalMemory,
}

/// Receives cross-runtime edges discovered by a Find walk
pub trait FindCallback {
    fn on_target_found(&mut self, source: TrackerId, target: &dyn TrackerTarget);
}

impl<F> FindCallback for F
where
    F: FnMut(TrackerId, &dyn TrackerTarget),
{
    fn on_target_found(&mut self, source: TrackerId, target: &dyn TrackerTarget) {
        self(source, target)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkCounters {
    pub visited: usize,
    pub pruned: usize,
    pub targets_found: usize,
    pub implicit_pegs: usize,
    pub invalid_edges: usize,
    pub external_bytes: usize,
}

/// State threaded through one walk: the phase, the find-walk id in force,
/// and the counters the coordinator reports as telemetry.
pub struct Walker<'a> {
    phase: WalkPhase,
    find_walk_id: u32,
    implicit_peg: bool,
    source: Option<TrackerId>,
    callback: Option<&'a mut dyn FindCallback>,
    counters: WalkCounters,
    diagnostic_visited: Vec<Weak<dyn Trackable>>,
}

impl<'a> Walker<'a> {
    pub fn new(phase: WalkPhase) -> Self {
        Self {
            phase,
            find_walk_id: 0,
            implicit_peg: false,
            source: None,
            callback: None,
            counters: WalkCounters::default(),
            diagnostic_visited: Vec::new(),
        }
    }

    /// Find walk rooted at `source`, reporting targets to `callback`
    pub fn find(find_walk_id: u32, source: TrackerId, callback: &'a mut dyn FindCallback) -> Self {
        Self {
            find_walk_id,
            source: Some(source),
            callback: Some(callback),
            ..Self::new(WalkPhase::Find)
        }
    }

    pub fn with_implicit_peg(mut self, enabled: bool) -> Self {
        self.implicit_peg = enabled;
        self
    }

    pub fn phase(&self) -> WalkPhase {
        self.phase
    }

    pub fn find_walk_id(&self) -> u32 {
        self.find_walk_id
    }

    pub fn implicit_peg_enabled(&self) -> bool {
        self.implicit_peg
    }

    pub fn counters(&self) -> WalkCounters {
        self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut WalkCounters {
        &mut self.counters
    }

    pub(crate) fn report_target(&mut self, target: &dyn TrackerTarget) {
        let Some(source) = self.source else {
            return;
        };

        self.counters.targets_found += 1;
        if let Some(callback) = self.callback.as_deref_mut() {
            callback.on_target_found(source, target);
        }
    }

    pub(crate) fn record_diagnostic_visit(&mut self, object: Weak<dyn Trackable>) {
        self.diagnostic_visited.push(object);
    }

    pub(crate) fn take_diagnostic_visits(&mut self) -> Vec<Weak<dyn Trackable>> {
        std::mem::take(&mut self.diagnostic_visited)
    }
}
