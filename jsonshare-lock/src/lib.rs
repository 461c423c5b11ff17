//! # jsonshare-lock
//!
//! Advisory, lease-style mutual exclusion over a sibling marker file.
//!
//! A lock is held while `<document>.lock` exists. [`MarkerLock::acquire`]
//! creates the marker with exclusive-create semantics and retries on a short
//! fixed interval; markers older than a multiple of the acquisition timeout
//! are treated as abandoned and reclaimed. Use [`MarkerLock::guard`] to tie
//! the hold to a scope.

pub mod error;
pub mod marker;

pub use error::LockError;
pub use marker::{
    marker_path_for, LockGuard, LockOptions, MarkerInfo, MarkerLock, DEFAULT_RETRY_INTERVAL,
    DEFAULT_STALE_MULTIPLIER,
};
