use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error surface for shared-state construction, `flush()` and the watch
/// registry.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document error: {0}")]
    Core(#[from] jsonshare_core::CoreError),

    #[error("lock error: {0}")]
    Lock(#[from] jsonshare_lock::LockError),

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("shared state must be opened inside a Tokio runtime")]
    NoRuntime,

    #[error("{0} task join failure")]
    TaskJoin(&'static str),

    /// Another writer held the lock for the whole timeout.
    #[error("lock {path} still held by another writer after {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// A background persist failed; surfaced by `flush()`.
    #[error("persist failed: {0}")]
    Persist(#[source] Arc<SyncError>),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
