//! Document file persistence.
//!
//! Reads come in two flavours: [`read_at`] is strict and reports every fault,
//! [`load_at`] never fails and treats a missing, empty, or corrupt file as an
//! empty document. Writes replace the whole file via `<path>.<pid>.tmp` and a
//! rename, so readers never observe a half-written document.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{io_err, CoreError};
use crate::types::Document;

/// Create `path` (and its parent directory) as an empty file if absent.
///
/// Returns `true` when the file was created by this call.
pub fn ensure_exists_at(path: &Path) -> Result<bool, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Read and parse the document at `path`.
pub fn read_at(path: &Path) -> Result<Document, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Err(CoreError::Empty {
            path: path.to_path_buf(),
        });
    }
    let value: Value = serde_json::from_str(&contents).map_err(|source| CoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(CoreError::NotAnObject {
            path: path.to_path_buf(),
        }),
    }
}

/// Load the document at `path`, falling back to an empty document.
pub fn load_at(path: &Path) -> Document {
    match read_at(path) {
        Ok(document) => document,
        Err(CoreError::Empty { .. }) => Document::new(),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "treating unreadable document as empty");
            Document::new()
        }
    }
}

/// Overwrite the document at `path` atomically.
pub fn save_at(path: &Path, document: &Document) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let json = serde_json::to_string_pretty(document)?;
    let tmp = tmp_path_for(path);
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// Remove the document at `path`; a missing file is not an error.
pub fn remove_at(path: &Path) -> Result<(), CoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Shallow merge: every key of `overlay` replaces the same key in `base`.
pub fn merge(mut base: Document, overlay: Document) -> Document {
    for (key, value) in overlay {
        base.insert(key, value);
    }
    base
}

// Per-process so that two writers racing without the lock cannot share a tmp.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.tmp", std::process::id()));
    PathBuf::from(name)
}
