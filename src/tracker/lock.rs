//! Per-core reentrant lock
//!
//! A thread token plus depth counter layered over `parking_lot::RawRwLock`,
//! taken exclusively. The first entry on a thread takes the raw lock, nested
//! entries bump the depth, the last exit releases it. Only the scoped guard
//! (and the crate-internal enter/exit pair used for cycle brackets and
//! external lock tokens) is exposed.

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Nonzero id of the calling thread, unique for the life of the process
pub fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

const NO_OWNER: u64 = 0;

pub struct ReentrantLock {
    raw: RawRwLock,
    owner: AtomicU64,
    /// Only touched by the owning thread
    depth: AtomicUsize,
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            owner: AtomicU64::new(NO_OWNER),
            depth: AtomicUsize::new(0),
        }
    }

    /// Enter the lock, blocking if another thread holds it
    pub fn lock(&self) -> ReentrantGuard<'_> {
        self.enter();
        ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Enter the lock only if that does not block
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_>> {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
        } else if self.raw.try_lock_exclusive() {
            self.owner.store(me, Ordering::Release);
            self.depth.store(1, Ordering::Relaxed);
        } else {
            return None;
        }

        Some(ReentrantGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn enter(&self) {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.raw.lock_exclusive();
        self.owner.store(me, Ordering::Release);
        self.depth.store(1, Ordering::Relaxed);
    }

    pub(crate) fn exit(&self) {
        if self.owner.load(Ordering::Acquire) != thread_token() {
            crate::fatal!("reentrant lock released by a thread that does not hold it");
        }

        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(NO_OWNER, Ordering::Release);
            // SAFETY: the owner check above proves this thread took the raw
            // lock in `enter`, and depth just reached zero.
            unsafe { self.raw.unlock_exclusive() };
        }
    }

    /// Nesting depth on the calling thread (0 if it does not hold the lock)
    pub fn enter_count(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread_token()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != NO_OWNER
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped entry into a `ReentrantLock`. Must be dropped on the thread that
/// created it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}
