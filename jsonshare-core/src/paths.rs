//! Shared document layout.
//!
//! ```text
//! <directory>/
//!   <id>.json        (document, overwritten whole on every persist)
//!   <id>.json.lock   (lock marker, present only while a write is in flight)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CoreError;
use crate::types::DocumentId;

pub const DEFAULT_DIR_NAME: &str = "jsonshare";
pub const DOCUMENT_EXTENSION: &str = "json";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(20);
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_READY_MAX_POLLS: u32 = 10;

/// Process-wide default directory: `<tmp>/jsonshare`.
pub fn default_directory() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_DIR_NAME)
}

/// `<dir>/<id>.json`. Pure; does no I/O.
pub fn document_path_at(dir: &Path, id: &DocumentId) -> Result<PathBuf, CoreError> {
    id.validate()?;
    Ok(dir.join(format!("{}.{DOCUMENT_EXTENSION}", id.0)))
}
