//! Scoped peg
//!
//! `PegGuard` keeps a referent pegged for its lifetime. It is not `Clone`;
//! moving it moves the single pending unpeg along with it.

use std::sync::Arc;

use super::trackable::Trackable;
use crate::error::{Result, TrackerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PegPolicy {
    /// Peg only a target that is still reachable
    IfReachable,
    Always,
}

#[must_use = "the peg is released as soon as the guard is dropped"]
pub struct PegGuard<T: Trackable> {
    target: Option<Arc<T>>,
    active_on_null: bool,
}

impl<T: Trackable> PegGuard<T> {
    pub fn new(target: Option<Arc<T>>, policy: PegPolicy) -> Self {
        Self::build(target, policy, false)
    }

    /// Like `new`, but a null target counts as active
    pub fn new_active_on_null(target: Option<Arc<T>>, policy: PegPolicy) -> Self {
        Self::build(target, policy, true)
    }

    /// Peg a target that must still be reachable
    pub fn try_peg(target: Arc<T>) -> Result<Self> {
        let id = target.tracker().id();
        let guard = Self::new(Some(target), PegPolicy::IfReachable);
        if guard.is_active() {
            Ok(guard)
        } else {
            Err(TrackerError::NotReachable(id))
        }
    }

    fn build(target: Option<Arc<T>>, policy: PegPolicy, active_on_null: bool) -> Self {
        let was_null = target.is_none();

        let target = target.filter(|t| match policy {
            PegPolicy::Always => true,
            PegPolicy::IfReachable => t.tracker().is_reachable(),
        });

        if let Some(t) = &target {
            t.tracker().update_peg(true);
        }

        Self {
            target,
            active_on_null: active_on_null && was_null,
        }
    }

    /// Holds a pegged target, or was built active-on-null from a null one
    pub fn is_active(&self) -> bool {
        self.target.is_some() || self.active_on_null
    }

    pub fn get(&self) -> Option<&T> {
        self.target.as_deref()
    }

    pub fn target(&self) -> Option<&Arc<T>> {
        self.target.as_ref()
    }
}

impl<T: Trackable> Drop for PegGuard<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.tracker().update_peg(false);
        }
    }
}

impl<T: Trackable> std::fmt::Debug for PegGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PegGuard")
            .field("target", &self.target.as_ref().map(|t| t.tracker().id()))
            .field("active", &self.is_active())
            .finish()
    }
}
