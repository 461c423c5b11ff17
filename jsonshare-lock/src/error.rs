//! Error types for jsonshare-lock.

use std::path::PathBuf;

use thiserror::Error;

/// Lock faults. Contention is not an error; it surfaces as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// Any filesystem failure other than "already exists" on acquire or
    /// "not found" on release.
    #[error("lock I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`LockError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.into(),
        source,
    }
}
