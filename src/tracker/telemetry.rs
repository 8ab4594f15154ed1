//! Walk statistics and the instrumentation sink
//!
//! Observational only: nothing in the protocol reads these back.

use std::time::Duration;

use super::phase::{WalkCounters, WalkPhase};
use super::CoreId;

/// Outcome of one `begin_cycle`/`end_cycle` bracket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycle: u64,
    pub cores: usize,
    /// Objects visited by the Peg and Reachable walks
    pub peers_walked: usize,
    pub pruned: usize,
    pub targets_found: usize,
    pub implicit_pegs: usize,
    pub reachable: usize,
    pub unreachable: usize,
    /// Weak links cut this cycle; objects already cut are not counted again
    pub weak_disconnects: usize,
    pub suspected_leaks: usize,
    pub duration: Duration,
}

impl CycleStats {
    pub(crate) fn absorb(&mut self, counters: &WalkCounters) {
        self.peers_walked += counters.visited;
        self.pruned += counters.pruned;
        self.targets_found += counters.targets_found;
        self.implicit_pegs += counters.implicit_pegs;
    }
}

/// Cumulative counters across all cycles of one coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub cycles_completed: u64,
    pub peers_walked: u64,
    pub targets_found: u64,
    pub unreachable_total: u64,
    pub weak_disconnects: u64,
    pub implicit_pegs: u64,
    pub suspected_leaks: u64,
    pub registered_cores: usize,
    pub tracked_objects: usize,
}

/// Result of a diagnostic walk from one root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measurement {
    pub objects: usize,
    pub external_bytes: usize,
}

pub trait WalkTelemetry: Send + Sync {
    fn on_cycle_begin(&self, _cycle: u64) {}

    fn on_phase_complete(&self, _core: CoreId, _phase: WalkPhase, _counters: &WalkCounters) {}

    fn on_cycle_complete(&self, _stats: &CycleStats) {}
}

/// Default sink
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl WalkTelemetry for NullTelemetry {}

/// Emits every callback as a `tracing` event under `reftrack::telemetry`
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl WalkTelemetry for TracingTelemetry {
    fn on_cycle_begin(&self, cycle: u64) {
        tracing::info!(target: "reftrack::telemetry", cycle, "cycle begin");
    }

    fn on_phase_complete(&self, core: CoreId, phase: WalkPhase, counters: &WalkCounters) {
        tracing::info!(
            target: "reftrack::telemetry",
            core = %core,
            phase = ?phase,
            visited = counters.visited,
            pruned = counters.pruned,
            targets_found = counters.targets_found,
            implicit_pegs = counters.implicit_pegs,
            "phase complete"
        );
    }

    fn on_cycle_complete(&self, stats: &CycleStats) {
        tracing::info!(
            target: "reftrack::telemetry",
            cycle = stats.cycle,
            peers_walked = stats.peers_walked,
            targets_found = stats.targets_found,
            unreachable = stats.unreachable,
            suspected_leaks = stats.suspected_leaks,
            duration_us = stats.duration.as_micros() as u64,
            "cycle complete"
        );
    }
}
