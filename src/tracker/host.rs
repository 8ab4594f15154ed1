//! Callbacks into the runtime that owns the tracing collector

/// Implemented by the external runtime. Every method defaults to a no-op
/// so hosts implement only what they drive.
pub trait TrackerHost: Send + Sync {
    /// Called at the end of a cycle, with core locks still held, so the
    /// host can drop connections from sources its collector found dead.
    fn disconnect_unused_reference_sources(&self) {}

    /// Called after every lock of the cycle has been released
    fn release_disconnected_reference_sources(&self) {}

    /// A core shut down all of its peers on the calling thread
    fn notify_end_of_reference_tracking_on_thread(&self) {}

    fn trigger_collection(&self) {}

    fn trigger_finalization(&self) {}
}
