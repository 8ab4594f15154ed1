//! Tracking coordinator - drives reference tracking cycles across cores
//!
//! One cycle:
//! 1. `begin_cycle`: cycle lock, then every active core's lock; Unpeg walks
//!    over every core's peer table, then Peg walks over every core
//! 2. `discover_targets`: Find walks from source-referenced objects the Peg
//!    walk did not reach
//! 3. `end_cycle`: Reachable walk, then weak links of unreached objects are
//!    cut; locks are released in reverse order
//!
//! Nothing but `begin_cycle` takes the cycle lock. Waiters use the
//! completion signal (`wait_for_idle`).

use once_cell::sync::Lazy;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, Mutex, RawMutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::core::{Core, CoreWalkState};
use super::host::TrackerHost;
use super::lock::thread_token;
use super::phase::{DiagnosticWalk, FindCallback, WalkCounters, WalkPhase, Walker};
use super::refs::WalkPin;
use super::state::{RefCountKind, TrackerState};
use super::telemetry::{CycleStats, Measurement, NullTelemetry, TrackerStats, WalkTelemetry};
use super::trackable::Trackable;
use super::{CoreId, TrackerId};
use crate::config::{LeakCheckMode, TrackerConfig};
use crate::error::{Result, TrackerError};
use crate::{fatal, logging};

/// Process-wide instance, created on first use and dropped when its last
/// core unregisters
static CURRENT: Lazy<Mutex<Option<Arc<TrackingCoordinator>>>> = Lazy::new(|| Mutex::new(None));

const NO_OWNER: u64 = 0;

type Deferred = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CycleProgress {
    started: Option<Instant>,
    stats: CycleStats,
}

#[derive(Default)]
struct Counters {
    cycles_completed: AtomicU64,
    peers_walked: AtomicU64,
    targets_found: AtomicU64,
    unreachable_total: AtomicU64,
    weak_disconnects: AtomicU64,
    implicit_pegs: AtomicU64,
    suspected_leaks: AtomicU64,
}

pub struct TrackingCoordinator {
    config: TrackerConfig,
    cores: Mutex<Vec<Arc<Core>>>,
    next_core_id: AtomicU32,

    /// Held from `begin_cycle` to `end_cycle`
    cycle_lock: RawMutex,
    cycle_owner: AtomicU64,
    cycle_number: AtomicU64,
    completed: Mutex<bool>,
    completion: Condvar,

    // Walk session; touched only by the cycle owner
    locked_cores: Mutex<Vec<Arc<Core>>>,
    find_walk_id: AtomicU32,
    walk_root: Mutex<Option<TrackerId>>,
    progress: Mutex<CycleProgress>,
    deferred: Mutex<Vec<Deferred>>,

    host: RwLock<Option<Arc<dyn TrackerHost>>>,
    telemetry: RwLock<Arc<dyn WalkTelemetry>>,
    counters: Counters,
}

impl TrackingCoordinator {
    pub fn new(config: TrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cores: Mutex::new(Vec::new()),
            next_core_id: AtomicU32::new(0),
            cycle_lock: RawMutex::INIT,
            cycle_owner: AtomicU64::new(NO_OWNER),
            cycle_number: AtomicU64::new(0),
            completed: Mutex::new(true),
            completion: Condvar::new(),
            locked_cores: Mutex::new(Vec::new()),
            find_walk_id: AtomicU32::new(0),
            walk_root: Mutex::new(None),
            progress: Mutex::new(CycleProgress::default()),
            deferred: Mutex::new(Vec::new()),
            host: RwLock::new(None),
            telemetry: RwLock::new(Arc::new(NullTelemetry)),
            counters: Counters::default(),
        })
    }

    /// The process-wide coordinator, created from the environment on first use
    pub fn ensure_initialized() -> Arc<Self> {
        let mut current = CURRENT.lock();
        if let Some(coordinator) = current.as_ref() {
            return Arc::clone(coordinator);
        }

        let coordinator = Self::new(TrackerConfig::from_env());
        *current = Some(Arc::clone(&coordinator));
        coordinator
    }

    pub fn current() -> Option<Arc<Self>> {
        CURRENT.lock().clone()
    }

    fn release_global(&self) {
        let mut current = CURRENT.lock();
        if current.as_ref().map_or(false, |c| std::ptr::eq(Arc::as_ptr(c), self)) {
            *current = None;
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn set_host(&self, host: Option<Arc<dyn TrackerHost>>) {
        *self.host.write() = host;
    }

    pub fn host(&self) -> Option<Arc<dyn TrackerHost>> {
        self.host.read().clone()
    }

    pub fn have_host(&self) -> bool {
        self.host.read().is_some()
    }

    pub fn set_telemetry(&self, telemetry: Arc<dyn WalkTelemetry>) {
        *self.telemetry.write() = telemetry;
    }

    fn telemetry(&self) -> Arc<dyn WalkTelemetry> {
        Arc::clone(&self.telemetry.read())
    }

    // ------------------------------------------------------------------
    // Cores
    // ------------------------------------------------------------------

    pub(crate) fn next_core_id(&self) -> CoreId {
        CoreId::from_raw(self.next_core_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a core and register it
    pub fn create_core(self: &Arc<Self>, name: impl Into<String>) -> Arc<Core> {
        let core = Core::new(self, name);
        self.register_core(&core);
        core
    }

    pub fn register_core(&self, core: &Arc<Core>) {
        if !std::ptr::eq(Arc::as_ptr(core.coordinator()), self) {
            fatal!("core {} belongs to another coordinator", core.id());
        }

        {
            let mut cores = self.cores.lock();
            if cores.iter().any(|c| Arc::ptr_eq(c, core)) {
                fatal!("core {} registered twice", core.id());
            }
            cores.push(Arc::clone(core));
        }

        core.set_registered(true);
        core.set_active(true);
        logging::log_core_lifecycle(core.id(), "registered", core.peer_count());
    }

    /// Remove an empty core. Removing the last one releases the
    /// process-wide instance if this is it.
    pub fn unregister_core(&self, core: &Arc<Core>) {
        let peers = core.peer_count();
        if peers > 0 {
            fatal!("core {} unregistered with {} live peers", core.id(), peers);
        }

        let now_empty = {
            let mut cores = self.cores.lock();
            let before = cores.len();
            cores.retain(|c| !Arc::ptr_eq(c, core));
            if cores.len() == before {
                fatal!("core {} unregistered but was never registered", core.id());
            }
            cores.is_empty()
        };

        core.set_active(false);
        core.set_registered(false);
        logging::log_core_lifecycle(core.id(), "unregistered", 0);

        if now_empty {
            self.release_global();
        }
    }

    /// Stop walking a core in future cycles. It stays registered.
    pub fn disable_core(&self, core: &Arc<Core>) {
        core.set_active(false);
        logging::log_core_lifecycle(core.id(), "disabled", core.peer_count());
    }

    pub fn is_core_registered(&self, core: &Arc<Core>) -> bool {
        self.cores.lock().iter().any(|c| Arc::ptr_eq(c, core))
    }

    pub fn cores(&self) -> Vec<Arc<Core>> {
        self.cores.lock().clone()
    }

    pub fn search_cores_for_object(&self, id: TrackerId) -> Option<Arc<Core>> {
        self.cores.lock().iter().find(|core| core.contains(id)).cloned()
    }

    // ------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------

    pub fn is_in_cycle(&self) -> bool {
        self.cycle_owner.load(Ordering::Acquire) != NO_OWNER
    }

    pub fn is_cycle_owned_by_current_thread(&self) -> bool {
        self.cycle_owner.load(Ordering::Acquire) == thread_token()
    }

    fn ensure_cycle_owner(&self) -> Result<()> {
        if !self.is_cycle_owned_by_current_thread() {
            return Err(TrackerError::NotInCycle);
        }
        Ok(())
    }

    fn set_completed(&self, done: bool) {
        let mut completed = self.completed.lock();
        *completed = done;
        if done {
            self.completion.notify_all();
        }
    }

    /// Lock every active core and run the Unpeg and Peg walks.
    ///
    /// Blocks while another thread owns a cycle. Calling it again on the
    /// thread that owns the current cycle is fatal.
    pub fn begin_cycle(&self) {
        let me = thread_token();
        if self.cycle_owner.load(Ordering::Acquire) == me {
            fatal!("begin_cycle on a thread that already owns the tracking cycle");
        }

        self.cycle_lock.lock();
        self.cycle_owner.store(me, Ordering::Release);

        let cores: Vec<Arc<Core>> = self.cores.lock().iter().filter(|c| c.is_active()).cloned().collect();
        for core in &cores {
            core.raw_lock().enter();
        }
        // Only now: a thread still inside a core lock must see the last
        // cycle as complete
        self.set_completed(false);

        let number = self.cycle_number.fetch_add(1, Ordering::Relaxed) + 1;
        self.find_walk_id.store(0, Ordering::Release);
        *self.walk_root.lock() = None;

        let mut stats = CycleStats {
            cycle: number,
            cores: cores.len(),
            ..CycleStats::default()
        };
        let started = Instant::now();
        logging::log_cycle_start(number, cores.len());
        self.telemetry().on_cycle_begin(number);

        // Each step covers every locked core before the next one starts:
        // a Peg walk may mark objects of any locked core
        let pinned: Vec<Vec<WalkPin>> = cores.iter().map(|core| core.snapshot()).collect();
        for pins in &pinned {
            for pin in pins {
                pin.tracker().prepare_for_walk();
            }
        }

        for core in &cores {
            core.set_walk_state(CoreWalkState::Unpegging);
        }
        for (core, pins) in cores.iter().zip(&pinned) {
            let unpeg = crate::time_block!("unpeg_walk", { self.walk_roots(core, pins, Walker::new(WalkPhase::Unpeg)) });
            stats.pruned += unpeg.pruned;
        }

        for core in &cores {
            core.set_walk_state(CoreWalkState::Pegging);
            core.flag_core_table_roots();
        }
        for (core, pins) in cores.iter().zip(&pinned) {
            let walker = Walker::new(WalkPhase::Peg).with_implicit_peg(self.config.implicit_peg);
            let peg = crate::time_block!("peg_walk", { self.walk_roots(core, pins, walker) });
            stats.absorb(&peg);
        }

        for core in &cores {
            core.set_walk_state(CoreWalkState::AwaitingDiscovery);
        }
        drop(pinned);

        *self.locked_cores.lock() = cores;
        *self.progress.lock() = CycleProgress {
            started: Some(started),
            stats,
        };
    }

    fn walk_roots(&self, core: &Core, pins: &[WalkPin], mut walker: Walker<'_>) -> WalkCounters {
        for pin in pins {
            pin.walk(&mut walker, true);
        }

        let counters = walker.counters();
        logging::log_phase_complete(core.id(), walker.phase(), counters.visited, counters.pruned);
        self.telemetry().on_phase_complete(core.id(), walker.phase(), &counters);
        counters
    }

    fn locked_core_in_state(&self, core: &Core, expected: CoreWalkState) {
        let state = core.walk_state();
        if state != expected {
            fatal!("core {} is {:?}, expected {:?}", core.id(), state, expected);
        }
    }

    /// Find walks from every object referenced by a tracker source that
    /// the Peg walk did not already protect. Returns the number of targets
    /// reported to `callback`.
    pub fn discover_targets<F: FindCallback>(&self, mut callback: F) -> Result<usize> {
        self.ensure_cycle_owner()?;

        let cores = self.locked_cores.lock().clone();
        let mut found = 0;

        for core in &cores {
            self.locked_core_in_state(core, CoreWalkState::AwaitingDiscovery);

            let pins = core.snapshot();
            for pin in &pins {
                let state = pin.tracker();
                if state.is_referenced_by_tracker_source() && !state.has_been_walked(WalkPhase::Peg) {
                    found += self.find_from(&**pin, &mut callback);
                }
            }
        }

        self.progress.lock().stats.targets_found += found;
        Ok(found)
    }

    /// Find walk from a single tracker source under a fresh find-walk id
    pub fn find_tracker_targets<F: FindCallback>(&self, root: &dyn Trackable, mut callback: F) -> Result<usize> {
        self.ensure_cycle_owner()?;
        self.locked_core_in_state(root.tracker().core(), CoreWalkState::AwaitingDiscovery);

        let found = self.find_from(root, &mut callback);
        self.progress.lock().stats.targets_found += found;
        Ok(found)
    }

    fn find_from(&self, root: &dyn Trackable, callback: &mut dyn FindCallback) -> usize {
        let id = self.next_find_walk_id();
        let source = root.tracker().id();

        *self.walk_root.lock() = Some(source);
        let mut walker = Walker::find(id, source, callback);
        root.walk(&mut walker, true);
        *self.walk_root.lock() = None;

        walker.counters().targets_found
    }

    fn next_find_walk_id(&self) -> u32 {
        let next = self.find_walk_id.load(Ordering::Acquire).wrapping_add(1);
        if next != 0 {
            self.find_walk_id.store(next, Ordering::Release);
            return next;
        }

        // Wrapped: stale tokens could match reissued ids
        tracing::debug!(target: "reftrack::cycle", "find-walk id wrapped, resetting tokens");
        let cores = self.locked_cores.lock().clone();
        for core in &cores {
            for pin in core.snapshot() {
                pin.tracker().reset_find_walk_id();
            }
        }
        self.find_walk_id.store(1, Ordering::Release);
        1
    }

    #[cfg(test)]
    pub(crate) fn set_find_walk_id(&self, id: u32) {
        self.find_walk_id.store(id, Ordering::Release);
    }

    pub fn current_find_walk_id(&self) -> u32 {
        self.find_walk_id.load(Ordering::Acquire)
    }

    pub fn is_root_of_tracker_walk(&self, id: TrackerId) -> bool {
        *self.walk_root.lock() == Some(id)
    }

    /// Reachable walk, weak-link disconnection, then release of every lock
    /// taken by `begin_cycle` in reverse order.
    pub fn end_cycle(&self) -> Result<CycleStats> {
        self.ensure_cycle_owner()?;

        let cores = std::mem::take(&mut *self.locked_cores.lock());
        let progress = std::mem::take(&mut *self.progress.lock());
        let mut stats = progress.stats;

        let mut pinned: Vec<Vec<WalkPin>> = Vec::with_capacity(cores.len());
        for core in &cores {
            self.locked_core_in_state(core, CoreWalkState::AwaitingDiscovery);
            core.set_walk_state(CoreWalkState::ComputingReachability);

            let pins = core.snapshot();
            let mut walker = Walker::new(WalkPhase::Reachable);
            crate::time_block!("reachable_walk", {
                for pin in &pins {
                    let state = pin.tracker();
                    if state.is_pegged(false) || state.is_referenced_by_tracker_source() {
                        pin.walk(&mut walker, true);
                    }
                }
            });

            let counters = walker.counters();
            stats.absorb(&counters);
            logging::log_phase_complete(core.id(), WalkPhase::Reachable, counters.visited, counters.pruned);
            self.telemetry().on_phase_complete(core.id(), WalkPhase::Reachable, &counters);
            pinned.push(pins);
        }

        // Reachability is final everywhere before any link is cut
        for pins in &pinned {
            for pin in pins {
                let state = pin.tracker();
                let outcome = state.on_tracking_processed();
                if outcome.reachable {
                    stats.reachable += 1;
                    continue;
                }

                stats.unreachable += 1;
                if outcome.disconnected {
                    stats.weak_disconnects += 1;
                }
                logging::log_unreachable(state.id(), outcome.disconnected);
                self.check_for_leak(state, &mut stats);
            }
        }

        let host = self.host();
        if let Some(host) = &host {
            host.disconnect_unused_reference_sources();
        }

        drop(pinned);
        for core in cores.iter().rev() {
            core.set_walk_state(CoreWalkState::Idle);
            core.raw_lock().exit();
        }

        self.find_walk_id.store(0, Ordering::Release);
        *self.walk_root.lock() = None;
        let deferred = std::mem::take(&mut *self.deferred.lock());
        stats.duration = progress.started.map(|s| s.elapsed()).unwrap_or_default();
        self.record(&stats);

        self.cycle_owner.store(NO_OWNER, Ordering::Release);
        self.set_completed(true);
        // SAFETY: ensure_cycle_owner proved this thread took the lock in begin_cycle
        unsafe { self.cycle_lock.unlock() };

        if let Some(host) = &host {
            host.release_disconnected_reference_sources();
        }

        logging::log_cycle_complete(
            stats.cycle,
            stats.duration.as_micros() as u64,
            stats.peers_walked,
            stats.targets_found,
            stats.unreachable,
        );
        self.telemetry().on_cycle_complete(&stats);

        for task in deferred {
            task();
        }

        Ok(stats)
    }

    /// `begin_cycle`, `discover_targets`, `end_cycle`
    pub fn run_cycle<F: FindCallback>(&self, callback: F) -> Result<CycleStats> {
        self.begin_cycle();
        self.discover_targets(callback)?;
        self.end_cycle()
    }

    fn check_for_leak(&self, state: &TrackerState, stats: &mut CycleStats) {
        if self.config.leak_check == LeakCheckMode::Off {
            return;
        }

        let expected = state.ref_count(RefCountKind::Expected);
        let actual = state.ref_count(RefCountKind::Actual);
        if expected == actual {
            return;
        }

        stats.suspected_leaks += 1;
        logging::log_suspected_leak(state.id(), expected, actual);

        if self.config.leak_check == LeakCheckMode::Assert && cfg!(debug_assertions) {
            fatal!(
                "tracker leak on {}: expected {} references, found {}",
                state.id(),
                expected,
                actual
            );
        }
    }

    fn record(&self, stats: &CycleStats) {
        let c = &self.counters;
        c.cycles_completed.fetch_add(1, Ordering::Relaxed);
        c.peers_walked.fetch_add(stats.peers_walked as u64, Ordering::Relaxed);
        c.targets_found.fetch_add(stats.targets_found as u64, Ordering::Relaxed);
        c.unreachable_total.fetch_add(stats.unreachable as u64, Ordering::Relaxed);
        c.weak_disconnects.fetch_add(stats.weak_disconnects as u64, Ordering::Relaxed);
        c.implicit_pegs.fetch_add(stats.implicit_pegs as u64, Ordering::Relaxed);
        c.suspected_leaks.fetch_add(stats.suspected_leaks as u64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Waiting and deferred work
    // ------------------------------------------------------------------

    /// Wait until no cycle is running.
    ///
    /// Never takes the cycle lock, so it is safe inside a core lock. On the
    /// thread that owns the running cycle it returns
    /// `CycleInProgressOnThread` at once.
    pub fn wait_for_idle(&self) -> Result<()> {
        let mut completed = self.completed.lock();
        if *completed {
            return Ok(());
        }
        if self.is_cycle_owned_by_current_thread() {
            return Err(TrackerError::CycleInProgressOnThread);
        }

        let interval = self.config.cycle_wait_timeout();
        while !*completed {
            if self.completion.wait_for(&mut completed, interval).timed_out() && !*completed {
                tracing::warn!(
                    target: "reftrack::cycle",
                    waited_ms = interval.as_millis() as u64,
                    "still waiting for the tracking cycle to end"
                );
            }
        }
        Ok(())
    }

    /// Run `task` once no cycle is in progress. On the cycle-owning thread
    /// it is queued until `end_cycle`; returns `true` when queued.
    pub fn run_when_idle(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.is_cycle_owned_by_current_thread() {
            self.deferred.lock().push(Box::new(task));
            return true;
        }

        // Never fails off the owning thread
        let _ = self.wait_for_idle();
        task();
        false
    }

    // ------------------------------------------------------------------
    // Host requests and diagnostics
    // ------------------------------------------------------------------

    pub fn trigger_collection(&self) -> bool {
        match self.host() {
            Some(host) => {
                host.trigger_collection();
                true
            }
            None => {
                tracing::trace!(target: "reftrack::cycle", "collection requested without a host");
                false
            }
        }
    }

    pub fn trigger_finalization(&self) -> bool {
        match self.host() {
            Some(host) => {
                host.trigger_finalization();
                true
            }
            None => false,
        }
    }

    /// Objects and external bytes reachable from `root`
    pub fn measure(&self, root: &dyn Trackable) -> Measurement {
        let counters = self.diagnostic_walk(root, DiagnosticWalk::ExternalMemory);
        Measurement {
            objects: counters.visited,
            external_bytes: counters.external_bytes,
        }
    }

    /// Objects reachable from `root`, `root` included
    pub fn count_objects(&self, root: &dyn Trackable) -> usize {
        self.diagnostic_walk(root, DiagnosticWalk::ObjectCount).visited
    }

    fn diagnostic_walk(&self, root: &dyn Trackable, kind: DiagnosticWalk) -> WalkCounters {
        let _guard = root.tracker().core().lock();

        let mut walker = Walker::new(WalkPhase::Diagnostic(kind));
        root.walk(&mut walker, true);

        for visited in walker.take_diagnostic_visits() {
            if let Some(object) = visited.upgrade() {
                object.tracker().clear_diagnostic_walked();
            }
        }
        walker.counters()
    }

    /// Invalid edge registrations across all registered cores
    pub fn validate_edges(&self) -> usize {
        self.cores().iter().map(|core| core.validate_peers()).sum()
    }

    pub fn unreachable_count(&self) -> u64 {
        self.counters.unreachable_total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TrackerStats {
        let c = &self.counters;
        let cores = self.cores.lock();

        TrackerStats {
            cycles_completed: c.cycles_completed.load(Ordering::Relaxed),
            peers_walked: c.peers_walked.load(Ordering::Relaxed),
            targets_found: c.targets_found.load(Ordering::Relaxed),
            unreachable_total: c.unreachable_total.load(Ordering::Relaxed),
            weak_disconnects: c.weak_disconnects.load(Ordering::Relaxed),
            implicit_pegs: c.implicit_pegs.load(Ordering::Relaxed),
            suspected_leaks: c.suspected_leaks.load(Ordering::Relaxed),
            registered_cores: cores.len(),
            tracked_objects: cores.iter().map(|core| core.peer_count()).sum(),
        }
    }
}

impl std::fmt::Debug for TrackingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingCoordinator")
            .field("cores", &self.cores.lock().len())
            .field("in_cycle", &self.is_in_cycle())
            .field("config", &self.config)
            .finish()
    }
}
