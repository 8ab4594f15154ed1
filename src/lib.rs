//! reftrack - reference tracking between a reference-counted native object
//! graph and an external tracing collector
//!
//! The external runtime drives cycles through [`TrackingCoordinator`];
//! native objects take part by embedding a [`TrackerState`] and holding
//! their outgoing references in [`TrackedEdge`] fields.

// Ambient
pub mod config;
pub mod error;
pub mod logging;

// Tracking protocol
pub mod tracker;

pub use config::{LeakCheckMode, TrackerConfig};
pub use error::{Result, TrackerError};
pub use tracker::{
    Core, CoreId, CoreWalkState, CreateOptions, CycleStats, EdgeKind, EdgeTarget, ExternalTracker, FindCallback,
    HandleId, Measurement, PegGuard, PegPolicy, RefCountKind, SourceRef, Trackable, TrackedEdge, TrackedRef,
    TrackerHost, TrackerId, TrackerState, TrackerStats, TrackerTarget, TrackerWeak, TracingTelemetry,
    TrackingCoordinator, WalkPhase, WalkTelemetry,
};

/// Initialize logging and return the process-wide coordinator
pub fn init() -> std::sync::Arc<TrackingCoordinator> {
    logging::init();
    TrackingCoordinator::ensure_initialized()
}
