//! Error types for jsonshare-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from document operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parse error on read, with the file path.
    #[error("failed to parse document at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error (write path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The document file exists but holds no content yet.
    #[error("document at {path} is empty")]
    Empty { path: PathBuf },

    /// The file parsed as JSON but the top-level value is not an object.
    #[error("document at {path} is not a JSON object")]
    NotAnObject { path: PathBuf },

    /// Ids map to file names, so separators and relative components are rejected.
    #[error("invalid document id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },
}

/// Convenience constructor for [`CoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
