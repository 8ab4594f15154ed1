//! Cross-heap reference tracking
//!
//! Native objects that can hold references into an external tracing
//! collector's heap embed a `TrackerState` and implement `Trackable`. The
//! coordinator walks them in phases so the external collector can see
//! which of its objects are kept alive from the native side.
//!
//! ```text
//!   TrackingCoordinator ──── begin_cycle / discover_targets / end_cycle
//!          │
//!          ├── Core (lock, peer table, core roots)
//!          │     └── Trackable ── TrackerState ── EdgeRegistry
//!          │                                        └── TrackedEdge<T> ──► Trackable
//!          │                                                          └──► TrackerTarget (external proxy)
//!          └── TrackerHost (external runtime callbacks)
//! ```

pub mod coordinator;
pub mod core;
pub mod edge;
pub mod external;
pub mod host;
pub mod lock;
pub mod peg;
pub mod phase;
pub mod refs;
pub mod state;
pub mod telemetry;
pub mod trackable;


use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use self::core::{Core, CoreWalkState, CreateOptions};
pub use coordinator::TrackingCoordinator;
pub use edge::{EdgeKind, TrackedEdge};
pub use external::{ExternalTracker, LockToken, TRACKER_INTERFACE_VERSION};
pub use host::TrackerHost;
pub use lock::{ReentrantGuard, ReentrantLock};
pub use peg::{PegGuard, PegPolicy};
pub use phase::{DiagnosticWalk, FindCallback, WalkCounters, WalkPhase, Walker};
pub use refs::{SourceRef, TrackedRef, TrackerWeak, WeakLink};
pub use state::{RefCountKind, TrackerState, MAX_PEG_COUNT};
pub use telemetry::{CycleStats, Measurement, NullTelemetry, TracingTelemetry, TrackerStats, WalkTelemetry};
pub use trackable::{EdgeTarget, Trackable, TrackerTarget};

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(u64);

impl TrackerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(u32);

impl CoreId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Slot in an object's handle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    pub(crate) owner: TrackerId,
    pub(crate) slot: u32,
}

impl HandleId {
    pub fn owner(&self) -> TrackerId {
        self.owner
    }
}
