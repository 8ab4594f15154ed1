//! Contract offered to the external runtime
//!
//! `ExternalTracker` is the versioned, object-safe surface the external
//! collector drives for each object. It is implemented for every
//! `Trackable`. Handles let callers without a typed `TrackedEdge` park a
//! `TrackerTarget` in a tracked slot owned by the object.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::core::Core;
use super::edge::TrackedEdge;
use super::phase::Walker;
use super::state::{RefCountKind, TrackerState};
use super::trackable::{EdgeTarget, Trackable, TrackerTarget};
use super::{HandleId, TrackerId};
use crate::error::{Result, TrackerError};
use crate::fatal;

pub const TRACKER_INTERFACE_VERSION: u32 = 1;

/// Type-erased proxy parked in a handle slot
pub(crate) struct OpaqueTarget(Arc<dyn TrackerTarget>);

impl EdgeTarget for OpaqueTarget {
    fn as_tracker_target(&self) -> Option<&dyn TrackerTarget> {
        Some(&*self.0)
    }
}

#[derive(Default)]
pub(crate) struct HandleTable {
    next_slot: u32,
    slots: HashMap<u32, TrackedEdge<OpaqueTarget>>,
}

impl TrackerState {
    fn validate_handle(&self, handle: HandleId) -> Result<()> {
        self.check_thread()?;
        if handle.owner != self.id() {
            return Err(TrackerError::HandleNotOwned {
                handle,
                owner: self.id(),
            });
        }
        Ok(())
    }

    pub fn create_handle(&self) -> Result<HandleId> {
        self.check_thread()?;

        let edge = TrackedEdge::new(self);
        let mut table = self.handles.lock();
        table.next_slot += 1;
        let slot = table.next_slot;
        table.slots.insert(slot, edge);

        Ok(HandleId { owner: self.id(), slot })
    }

    pub fn delete_handle(&self, handle: HandleId) -> Result<()> {
        self.validate_handle(handle)?;

        let removed = self.handles.lock().slots.remove(&handle.slot);
        match removed {
            // Released here, outside the table lock
            Some(edge) => {
                drop(edge);
                Ok(())
            }
            None => Err(TrackerError::InvalidHandle(handle)),
        }
    }

    pub fn set_handle_value(&self, handle: HandleId, value: Option<Arc<dyn TrackerTarget>>) -> Result<()> {
        self.validate_handle(handle)?;

        let table = self.handles.lock();
        let edge = table
            .slots
            .get(&handle.slot)
            .ok_or(TrackerError::InvalidHandle(handle))?;
        edge.set(value.map(|target| Arc::new(OpaqueTarget(target))));
        Ok(())
    }

    /// The parked target, if the owner may use it right now
    pub fn try_get_safe_handle_value(&self, handle: HandleId) -> Result<Option<Arc<dyn TrackerTarget>>> {
        self.validate_handle(handle)?;
        if !self.is_value_safe_to_use() {
            return Err(TrackerError::UnsafeValue(self.id()));
        }

        let table = self.handles.lock();
        let edge = table
            .slots
            .get(&handle.slot)
            .ok_or(TrackerError::InvalidHandle(handle))?;
        Ok(edge.get().map(|opaque| Arc::clone(&opaque.0)))
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().slots.len()
    }
}

/// Entry into an object's core lock taken by the external runtime.
/// Released by `ExternalTracker::release_lock` or on drop, on the same thread.
#[must_use = "dropping the token releases the lock"]
pub struct LockToken {
    core: Arc<Core>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.core.raw_lock().exit();
    }
}

pub trait ExternalTracker: Send + Sync {
    fn interface_version(&self) -> u32 {
        TRACKER_INTERFACE_VERSION
    }

    fn tracker_id(&self) -> TrackerId;

    fn prepare_for_walk(&self);

    fn walk(&self, walker: &mut Walker<'_>, is_root: bool) -> bool;

    fn update_peg(&self, peg: bool);

    fn ref_count(&self, kind: RefCountKind) -> usize;

    fn check_thread(&self) -> Result<()>;

    fn connect_from_tracker_source(&self);

    fn disconnect_from_tracker_source(&self);

    fn add_ref_from_tracker_source(&self);

    fn release_from_tracker_source(&self);

    fn create_handle(&self) -> Result<HandleId>;

    fn delete_handle(&self, handle: HandleId) -> Result<()>;

    fn set_value(&self, handle: HandleId, value: Option<Arc<dyn TrackerTarget>>) -> Result<()>;

    fn try_get_safe_value(&self, handle: HandleId) -> Result<Option<Arc<dyn TrackerTarget>>>;

    fn acquire_lock(&self) -> LockToken;

    fn release_lock(&self, token: LockToken);
}

impl<T: Trackable> ExternalTracker for T {
    fn tracker_id(&self) -> TrackerId {
        self.tracker().id()
    }

    fn prepare_for_walk(&self) {
        self.tracker().prepare_for_walk();
    }

    fn walk(&self, walker: &mut Walker<'_>, is_root: bool) -> bool {
        let object: &dyn Trackable = self;
        let _guard = self.tracker().core().lock();
        object.walk(walker, is_root)
    }

    fn update_peg(&self, peg: bool) {
        self.tracker().update_peg(peg);
    }

    fn ref_count(&self, kind: RefCountKind) -> usize {
        self.tracker().ref_count(kind)
    }

    fn check_thread(&self) -> Result<()> {
        self.tracker().check_thread()
    }

    fn connect_from_tracker_source(&self) {
        self.tracker().connect_from_tracker_source();
    }

    fn disconnect_from_tracker_source(&self) {
        self.tracker().disconnect_from_tracker_source();
    }

    fn add_ref_from_tracker_source(&self) {
        self.tracker().add_ref_from_tracker_source();
    }

    fn release_from_tracker_source(&self) {
        self.tracker().release_from_tracker_source();
    }

    fn create_handle(&self) -> Result<HandleId> {
        self.tracker().create_handle()
    }

    fn delete_handle(&self, handle: HandleId) -> Result<()> {
        self.tracker().delete_handle(handle)
    }

    fn set_value(&self, handle: HandleId, value: Option<Arc<dyn TrackerTarget>>) -> Result<()> {
        self.tracker().set_handle_value(handle, value)
    }

    fn try_get_safe_value(&self, handle: HandleId) -> Result<Option<Arc<dyn TrackerTarget>>> {
        self.tracker().try_get_safe_handle_value(handle)
    }

    fn acquire_lock(&self) -> LockToken {
        let core = Arc::clone(self.tracker().core());
        core.raw_lock().enter();
        LockToken {
            core,
            _not_send: PhantomData,
        }
    }

    fn release_lock(&self, token: LockToken) {
        if !Arc::ptr_eq(&token.core, self.tracker().core()) {
            fatal!("lock token released through an object of another core");
        }
        drop(token);
    }
}
