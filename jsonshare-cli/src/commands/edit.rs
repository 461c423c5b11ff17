//! `jsonshare set` / `jsonshare remove`: edit through the lock protocol.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;

use jsonshare_sync::{SharedState, SyncError};

use super::Target;

/// Arguments for `jsonshare set`.
#[derive(Args, Debug)]
pub struct SetArgs {
    /// Document id.
    pub id: String,

    pub key: String,

    /// JSON value; anything that does not parse is stored as a string.
    pub value: String,
}

impl SetArgs {
    pub async fn run(self, target: &Target) -> Result<()> {
        let value = parse_value(&self.value);
        let state = SharedState::open(self.id.as_str(), target.options())
            .with_context(|| format!("failed to open document '{}'", self.id))?;

        state.set(self.key, value);
        persisted(&state, &self.id).await
    }
}

/// Arguments for `jsonshare remove`.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Document id.
    pub id: String,

    pub key: String,
}

impl RemoveArgs {
    pub async fn run(self, target: &Target) -> Result<()> {
        let state = SharedState::open(self.id.as_str(), target.options())
            .with_context(|| format!("failed to open document '{}'", self.id))?;

        if state.remove(&self.key).is_none() {
            bail!("key '{}' not found in document '{}'", self.key, self.id);
        }
        persisted(&state, &self.id).await
    }
}

/// Wait for the edit to reach the file and report how the write went.
async fn persisted(state: &SharedState, id: &str) -> Result<()> {
    match state.flush().await {
        Ok(()) => Ok(()),
        Err(SyncError::LockTimeout { path, .. }) => bail!(
            "document '{id}' is locked by another writer ({}); change not persisted",
            path.display()
        ),
        Err(err) => Err(err).with_context(|| format!("failed to persist document '{id}'")),
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
