//! Error types
//!
//! Two tiers:
//! - `TrackerError`: expected, transient conditions the caller checks and
//!   retries or ignores (wrong thread, stale handle, unreachable value)
//! - `fatal!`: invariant violations that would corrupt shared walk state.
//!   These log at `error` and panic; release builds abort on panic.

use thiserror::Error;

use crate::tracker::{HandleId, TrackerId};

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("object {0} is bound to another thread")]
    WrongThread(TrackerId),

    #[error("handle {0:?} does not name a live slot")]
    InvalidHandle(HandleId),

    #[error("handle {handle:?} is not owned by object {owner}")]
    HandleNotOwned { handle: HandleId, owner: TrackerId },

    #[error("value held by object {0} is not safe to use during the current cycle")]
    UnsafeValue(TrackerId),

    #[error("object {0} is not reachable")]
    NotReachable(TrackerId),

    #[error("weak reference has been disconnected")]
    Disconnected,

    #[error("the calling thread owns the tracking cycle in progress")]
    CycleInProgressOnThread,

    #[error("no tracking cycle is owned by the calling thread")]
    NotInCycle,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Report an invariant violation and stop.
///
/// Evaluates to `!`, so it can sit in any expression position.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        ::tracing::error!(target: "reftrack::fatal", "{}", message);
        panic!("{}", message)
    }};
}
