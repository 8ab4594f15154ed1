use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reftrack::{
    Core, EdgeTarget, PegGuard, PegPolicy, SourceRef, Trackable, TrackedEdge, TrackedRef, TrackerConfig, TrackerId,
    TrackerState, TrackerTarget, TrackingCoordinator,
};
use std::sync::Arc;

struct Node {
    state: TrackerState,
    next: TrackedEdge<Node>,
    proxy: TrackedEdge<Proxy>,
}

impl Node {
    fn new(core: &Arc<Core>) -> Self {
        let state = TrackerState::new(core);
        let next = TrackedEdge::new(&state);
        let proxy = TrackedEdge::new(&state);
        Self { state, next, proxy }
    }
}

impl EdgeTarget for Node {
    fn as_trackable(&self) -> Option<&dyn Trackable> {
        Some(self)
    }
}

impl Trackable for Node {
    fn tracker(&self) -> &TrackerState {
        &self.state
    }
}

struct Proxy;

impl EdgeTarget for Proxy {
    fn as_tracker_target(&self) -> Option<&dyn TrackerTarget> {
        Some(self)
    }
}

impl TrackerTarget for Proxy {
    fn add_ref_from_tracker(&self) {}
    fn release_from_tracker(&self) {}
    fn peg(&self) {}
    fn unpeg(&self) {}
}

/// Singly linked chain of `len` nodes, each holding one proxy
fn chain(core: &Arc<Core>, len: usize) -> Vec<TrackedRef<Node>> {
    let nodes: Vec<_> = (0..len).map(|_| core.track(Node::new(core))).collect();
    for pair in nodes.windows(2) {
        pair[0].next.set_ref(&pair[1]);
    }
    for node in &nodes {
        node.proxy.set(Some(Arc::new(Proxy)));
    }
    nodes
}

fn ignore(_: TrackerId, _: &dyn TrackerTarget) {}

fn bench_pegged_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("pegged_cycle");

    for len in [100, 500, 2_000] {
        let coordinator = TrackingCoordinator::new(TrackerConfig::default());
        let core = coordinator.create_core("bench");
        let nodes = chain(&core, len);
        let _peg = PegGuard::new(Some(nodes[0].to_arc()), PegPolicy::Always);

        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| black_box(coordinator.run_cycle(ignore).unwrap()));
        });
    }

    group.finish();
}

fn bench_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");

    for len in [100, 500, 2_000] {
        let coordinator = TrackingCoordinator::new(TrackerConfig::default());
        let core = coordinator.create_core("bench");
        let nodes = chain(&core, len);
        let _source = SourceRef::new(&nodes[0]);

        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| black_box(coordinator.run_cycle(ignore).unwrap()));
        });
    }

    group.finish();
}

fn bench_edge_set(c: &mut Criterion) {
    let coordinator = TrackingCoordinator::new(TrackerConfig::default());
    let core = coordinator.create_core("bench");
    let owner = core.track(Node::new(&core));
    let a = core.track(Node::new(&core));
    let b = core.track(Node::new(&core));

    c.bench_function("edge_set", |bench| {
        bench.iter(|| {
            owner.next.set_ref(black_box(&a));
            owner.next.set_ref(black_box(&b));
        });
    });
}

fn bench_update_peg(c: &mut Criterion) {
    let coordinator = TrackingCoordinator::new(TrackerConfig::default());
    let core = coordinator.create_core("bench");
    let node = core.track(Node::new(&core));

    c.bench_function("update_peg", |b| {
        b.iter(|| {
            node.tracker().update_peg(true);
            node.tracker().update_peg(false);
        });
    });
}

criterion_group!(benches, bench_pegged_cycle, bench_discovery, bench_edge_set, bench_update_peg);
criterion_main!(benches);
