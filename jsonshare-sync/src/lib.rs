//! # jsonshare-sync
//!
//! Keeps an in-memory [`Mirror`](jsonshare_core::Mirror) and a shared JSON
//! document file eventually consistent across processes.
//!
//! - [`SharedState`]: one synchronized instance that persists on local change,
//!   reloads on external change and offers a readiness barrier.
//! - [`WatchRegistry`]: process-wide, reference-counted filesystem watches
//!   keyed by document path.

mod error;
pub mod shared;
pub mod watch;

pub use error::SyncError;
pub use shared::{SharedState, SharedStateOptions};
pub use watch::{Subscription, WatchCallback, WatchRegistry};
