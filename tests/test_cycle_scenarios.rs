mod common;

use common::{ignore_targets, setup, setup_with, FakeProxy, Widget};
use reftrack::{
    CoreWalkState, CycleStats, PegGuard, PegPolicy, SourceRef, Trackable, TrackerConfig, TrackerError, TrackerId,
    TrackerTarget, WalkPhase,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_unrooted_object_is_collected() {
    let (coordinator, core) = setup();
    let a = core.track(Widget::new(&core));
    let weak = a.downgrade();
    let before = coordinator.unreachable_count();

    coordinator.begin_cycle();
    assert!(!a.tracker().is_implicitly_pegged());
    assert!(!a.tracker().is_pegged(false));
    coordinator.discover_targets(ignore_targets).unwrap();
    let stats = coordinator.end_cycle().unwrap();

    assert!(!a.tracker().is_reachable());
    assert!(weak.upgrade().is_none());
    assert_eq!(stats.unreachable, 1);
    assert_eq!(stats.suspected_leaks, 0);
    assert_eq!(coordinator.unreachable_count(), before + 1);
}

#[test]
fn test_pegged_parent_keeps_child_reachable() {
    let (coordinator, core) = setup();
    let a = core.track(Widget::new(&core));
    let b = core.track(Widget::new(&core));
    a.children[0].set_ref(&b);

    let _peg = PegGuard::new(Some(a.to_arc()), PegPolicy::Always);

    coordinator.begin_cycle();
    coordinator.discover_targets(ignore_targets).unwrap();
    let stats = coordinator.end_cycle().unwrap();

    assert!(a.tracker().is_reachable());
    assert!(b.tracker().is_reachable());
    assert!(!b.tracker().is_pegged(false));
    assert_eq!(stats.unreachable, 0);
    assert!(b.downgrade().upgrade().is_some());
}

#[test]
fn test_same_thread_wait_does_not_deadlock() {
    let (coordinator, _core) = setup_with(TrackerConfig {
        cycle_wait_timeout_ms: 10_000,
        ..TrackerConfig::default()
    });

    coordinator.begin_cycle();
    let started = Instant::now();
    assert_eq!(coordinator.wait_for_idle(), Err(TrackerError::CycleInProgressOnThread));
    assert!(started.elapsed() < Duration::from_secs(1));
    coordinator.end_cycle().unwrap();

    assert_eq!(coordinator.wait_for_idle(), Ok(()));
}

#[test]
#[should_panic(expected = "already owns the tracking cycle")]
fn test_nested_begin_is_fatal() {
    let (coordinator, _core) = setup();
    coordinator.begin_cycle();
    coordinator.begin_cycle();
}

#[test]
fn test_proxy_pegged_then_unpegged() {
    let (coordinator, core) = setup();
    let a = core.track(Widget::new(&core));
    let proxy = Arc::new(FakeProxy::default());
    a.proxy.set(Some(Arc::clone(&proxy)));

    let peg = PegGuard::new(Some(a.to_arc()), PegPolicy::Always);
    coordinator.run_cycle(ignore_targets).unwrap();
    assert!(proxy.is_pegged());

    drop(peg);
    coordinator.run_cycle(ignore_targets).unwrap();
    assert!(!proxy.is_pegged());
    assert!(!a.tracker().is_reachable());
}

#[test]
fn test_discovery_reports_each_cross_edge_once() {
    let (coordinator, core) = setup();
    let root = core.track(Widget::new(&core));
    let shared = core.track(Widget::new(&core));
    let proxy = Arc::new(FakeProxy::default());

    shared.proxy.set(Some(Arc::clone(&proxy)));
    root.children[0].set_ref(&shared);
    root.children[1].set_ref(&shared);
    let _source = SourceRef::new(&root);

    let mut found: Vec<TrackerId> = Vec::new();
    coordinator.begin_cycle();
    let count = coordinator
        .discover_targets(|source: TrackerId, _: &dyn TrackerTarget| found.push(source))
        .unwrap();
    coordinator.end_cycle().unwrap();

    assert_eq!(count, 1);
    assert_eq!(found, vec![root.id()]);
    assert!(shared.tracker().is_reachable());
}

#[test]
fn test_cores_are_walked_independently() {
    let (coordinator, first) = setup();
    let second = coordinator.create_core("second");

    let kept = first.track(Widget::new(&first));
    let dropped = second.track(Widget::new(&second));
    let _peg = PegGuard::new(Some(kept.to_arc()), PegPolicy::Always);

    coordinator.begin_cycle();
    assert_eq!(first.walk_state(), CoreWalkState::AwaitingDiscovery);
    assert_eq!(second.walk_state(), CoreWalkState::AwaitingDiscovery);
    let stats: CycleStats = coordinator.end_cycle().unwrap();

    assert_eq!(stats.cores, 2);
    assert!(kept.tracker().is_reachable());
    assert!(!dropped.tracker().is_reachable());
    assert_eq!(second.walk_state(), CoreWalkState::Idle);
}

#[test]
fn test_cross_core_edges_are_followed() {
    let (coordinator, first) = setup();
    let second = coordinator.create_core("second");

    let parent = first.track(Widget::new(&first));
    let child = second.track(Widget::new(&second));
    parent.children[0].set_ref(&child);
    let _source = SourceRef::new(&parent);

    coordinator.run_cycle(ignore_targets).unwrap();
    assert!(child.tracker().is_reachable());
}

#[test]
fn test_pegged_root_protects_child_in_other_core() {
    let (coordinator, first) = setup();
    let second = coordinator.create_core("second");

    let parent = first.track(Widget::new(&first));
    let child = second.track(Widget::new(&second));
    let proxy = Arc::new(FakeProxy::default());
    child.proxy.set(Some(Arc::clone(&proxy)));
    parent.children[0].set_ref(&child);
    let _peg = PegGuard::new(Some(parent.to_arc()), PegPolicy::Always);

    for _ in 0..2 {
        let stats = coordinator.run_cycle(ignore_targets).unwrap();
        assert_eq!(stats.unreachable, 0);
        assert!(child.tracker().is_reachable());
        assert!(!child.tracker().is_weak_disconnected());
        assert!(proxy.is_pegged());
    }
}

#[test]
fn test_discovery_skips_source_pegged_from_other_core() {
    let (coordinator, first) = setup();
    let second = coordinator.create_core("second");

    let parent = first.track(Widget::new(&first));
    let child = second.track(Widget::new(&second));
    child.proxy.set(Some(Arc::new(FakeProxy::default())));
    parent.children[0].set_ref(&child);
    let _peg = PegGuard::new(Some(parent.to_arc()), PegPolicy::Always);
    let _source = SourceRef::new(&child);

    coordinator.begin_cycle();
    assert!(child.tracker().has_been_walked(WalkPhase::Peg));
    let found = coordinator.discover_targets(ignore_targets).unwrap();
    coordinator.end_cycle().unwrap();

    assert_eq!(found, 0);
    assert!(child.tracker().is_reachable());
}

#[test]
fn test_try_make_peg_guard_skips_collected_neighbor() {
    let (coordinator, core) = setup();
    let owner = core.track(Widget::new(&core));
    let neighbor = core.track(Widget::new(&core));
    owner.children[0].set_ref(&neighbor);

    coordinator.run_cycle(ignore_targets).unwrap();
    let guard = owner.children[0].try_make_peg_guard();
    assert!(!guard.is_active());
    drop(guard);

    neighbor.tracker().resurrect();
    let guard = owner.children[0].try_make_peg_guard();
    assert!(guard.is_active());
    assert_eq!(neighbor.tracker().peg_count(), 1);
}
