//! `jsonshare get`: print a document or a single key.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;

use jsonshare_core::document;

use super::Target;

/// Arguments for `jsonshare get`.
#[derive(Args, Debug)]
pub struct GetArgs {
    /// Document id.
    pub id: String,

    /// Only print this key.
    pub key: Option<String>,
}

impl GetArgs {
    pub fn run(self, target: &Target) -> Result<()> {
        let path = target.document_path(&self.id)?;
        let mut current = document::load_at(&path);

        let value = match self.key {
            Some(key) => match current.remove(&key) {
                Some(value) => value,
                None => bail!("key '{key}' not found in document '{}'", self.id),
            },
            None => Value::Object(current),
        };

        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("failed to render JSON")?
        );
        Ok(())
    }
}
