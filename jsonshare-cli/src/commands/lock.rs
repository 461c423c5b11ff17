//! `jsonshare lock`: lock marker diagnostics.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;

use jsonshare_lock::{MarkerInfo, MarkerLock};

use super::Target;

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show whether the document is locked, by whom and for how long.
    Status {
        /// Document id.
        id: String,
    },
    /// Remove the lock marker, e.g. one left behind by a crashed writer.
    Clear {
        /// Document id.
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct LockStatus {
    document: String,
    marker: String,
    locked: bool,
    owner: Option<String>,
    age_ms: Option<u64>,
    modified_at: Option<String>,
}

impl LockStatus {
    fn new(lock: &MarkerLock, document: String, info: Option<MarkerInfo>) -> Self {
        Self {
            document,
            marker: lock.marker_path().display().to_string(),
            locked: info.is_some(),
            owner: info.as_ref().map(|info| info.owner.clone()),
            age_ms: info.as_ref().map(|info| info.age.as_millis() as u64),
            modified_at: info
                .as_ref()
                .map(|info| DateTime::<Utc>::from(info.modified).to_rfc3339()),
        }
    }
}

pub fn run(command: LockCommand, target: &Target) -> Result<()> {
    match command {
        LockCommand::Status { id } => {
            let path = target.document_path(&id)?;
            let lock = MarkerLock::new(&path);
            let status = LockStatus::new(&lock, path.display().to_string(), lock.inspect());
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render lock status")?
            );
        }
        LockCommand::Clear { id } => {
            let path = target.document_path(&id)?;
            let lock = MarkerLock::new(&path);
            if !lock.is_locked() {
                println!("document '{id}' is not locked");
                return Ok(());
            }
            lock.release()
                .with_context(|| format!("failed to remove {}", lock.marker_path().display()))?;
            tracing::info!(marker = %lock.marker_path().display(), "cleared lock marker");
            println!("removed lock marker: {}", lock.marker_path().display());
        }
    }
    Ok(())
}
