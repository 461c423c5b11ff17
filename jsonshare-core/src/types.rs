//! Domain types for shared documents.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The content of a shared document: string keys to arbitrary JSON values.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// A strongly-typed identifier for a shared document.
///
/// The id becomes the file stem of `<dir>/<id>.json`, so two instances in any
/// process that use the same id and directory share one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Check that the id can be used as a single file name component.
    pub fn validate(&self) -> Result<(), CoreError> {
        let reason = if self.0.is_empty() {
            Some("must not be empty")
        } else if self.0.contains(['/', '\\']) {
            Some("must not contain path separators")
        } else if self.0 == "." || self.0 == ".." {
            Some("must not be a relative path component")
        } else if self.0.contains('\0') {
            Some("must not contain NUL bytes")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CoreError::InvalidId {
                id: self.0.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("settings")]
    #[case("app.state")]
    #[case("worker-42")]
    fn accepts_plain_file_stems(#[case] id: &str) {
        assert!(DocumentId::from(id).validate().is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("..")]
    #[case("nested/doc")]
    #[case("win\\doc")]
    fn rejects_ids_that_escape_the_directory(#[case] id: &str) {
        let err = DocumentId::from(id).validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidId { .. }));
    }
}
