pub mod edit;
pub mod get;
pub mod lock;
pub mod watch;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use jsonshare_core::{paths::document_path_at, DocumentId};
use jsonshare_sync::SharedStateOptions;

/// Global flags shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Target {
    pub directory: PathBuf,
    pub lock_timeout: Duration,
}

impl Target {
    pub fn document_path(&self, id: &str) -> Result<PathBuf> {
        document_path_at(&self.directory, &DocumentId::from(id))
            .with_context(|| format!("cannot locate document '{id}'"))
    }

    /// The CLI is never the owner of a document, so it never cleans up.
    pub fn options(&self) -> SharedStateOptions {
        SharedStateOptions::new()
            .with_directory(&self.directory)
            .with_cleanup_on_dispose(false)
            .with_lock_timeout(self.lock_timeout)
            .with_persist_debounce(Duration::ZERO)
    }
}
