//! Owning handles
//!
//! - `TrackedRef<T>`: strong handle counted as an expected reference
//! - `TrackerWeak<T>`: weak handle that dies with the object's weak link
//! - `SourceRef<T>`: a tracker source's reference and connection, as RAII
//! - `WalkPin`: strong reference held by a walk, excluded from actual counts

use parking_lot::RwLock;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::trackable::Trackable;
use super::TrackerId;
use crate::error::{Result, TrackerError};

/// Shared connectivity flag behind every weak reference to one object.
/// Cut once when a cycle finds the object unreachable.
pub struct WeakLink {
    connected: RwLock<bool>,
}

impl WeakLink {
    pub(crate) fn new() -> Self {
        Self {
            connected: RwLock::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Returns `true` only for the call that cut the link
    pub(crate) fn disconnect(&self) -> bool {
        std::mem::replace(&mut *self.connected.write(), false)
    }
}

/// Strong handle the graph accounts for.
///
/// Untracked clones (`to_arc`) raise the actual count above the expected
/// count, which the next Peg walk treats as an implicit peg.
pub struct TrackedRef<T: Trackable> {
    inner: Arc<T>,
}

impl<T: Trackable> TrackedRef<T> {
    /// Count an existing strong reference as expected
    pub fn adopt(inner: Arc<T>) -> Self {
        inner.tracker().add_expected();
        Self { inner }
    }

    pub fn id(&self) -> TrackerId {
        self.inner.tracker().id()
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }

    /// Untracked strong reference
    pub fn to_arc(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> TrackerWeak<T> {
        TrackerWeak {
            link: self.inner.tracker().weak_link(),
            target: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: Trackable> Clone for TrackedRef<T> {
    fn clone(&self) -> Self {
        Self::adopt(Arc::clone(&self.inner))
    }
}

impl<T: Trackable> Drop for TrackedRef<T> {
    fn drop(&mut self) {
        self.inner.tracker().release_expected();
    }
}

impl<T: Trackable> Deref for TrackedRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Trackable> fmt::Debug for TrackedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrackedRef").field(&self.id()).finish()
    }
}

pub struct TrackerWeak<T: Trackable> {
    link: Arc<WeakLink>,
    target: Weak<T>,
}

impl<T: Trackable> TrackerWeak<T> {
    /// `None` once the object is gone or its link was cut
    pub fn upgrade(&self) -> Option<TrackedRef<T>> {
        let connected = self.link.connected.read();
        if !*connected {
            return None;
        }
        self.target.upgrade().map(TrackedRef::adopt)
    }

    pub fn try_upgrade(&self) -> Result<TrackedRef<T>> {
        self.upgrade().ok_or(TrackerError::Disconnected)
    }

    pub fn is_disconnected(&self) -> bool {
        !self.link.is_connected()
    }
}

impl<T: Trackable> Clone for TrackerWeak<T> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            target: Weak::clone(&self.target),
        }
    }
}

/// Reference held by a tracker source, plus its live connection.
/// Hosts drop the connection with `disconnect` when the external side
/// no longer reaches the object; the reference goes on drop.
pub struct SourceRef<T: Trackable> {
    object: TrackedRef<T>,
    connected: AtomicBool,
}

impl<T: Trackable> SourceRef<T> {
    pub fn new(object: &TrackedRef<T>) -> Self {
        let state = object.tracker();
        state.add_ref_from_tracker_source();
        state.connect_from_tracker_source();

        Self {
            object: object.clone(),
            connected: AtomicBool::new(true),
        }
    }

    pub fn object(&self) -> &TrackedRef<T> {
        &self.object
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.object.tracker().disconnect_from_tracker_source();
        }
    }

    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.object.tracker().connect_from_tracker_source();
        }
    }
}

impl<T: Trackable> Drop for SourceRef<T> {
    fn drop(&mut self) {
        self.disconnect();
        self.object.tracker().release_from_tracker_source();
    }
}

/// Strong reference taken by a walk over a peer table
pub(crate) struct WalkPin {
    object: Arc<dyn Trackable>,
}

impl WalkPin {
    pub(crate) fn new(object: Arc<dyn Trackable>) -> Self {
        object.tracker().pin_for_walk();
        Self { object }
    }
}

impl Deref for WalkPin {
    type Target = dyn Trackable;

    fn deref(&self) -> &Self::Target {
        &*self.object
    }
}

impl Drop for WalkPin {
    fn drop(&mut self) {
        self.object.tracker().unpin_for_walk();
    }
}
