//! `jsonshare watch`: stream document changes as JSON lines.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use jsonshare_core::{Document, MirrorChange};
use jsonshare_sync::SharedState;

use super::Target;

/// Arguments for `jsonshare watch`.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Document id.
    pub id: String,

    /// Exit after this many changes instead of waiting for Ctrl-C.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WatchLine {
    Snapshot { value: Value },
    Set { key: String, value: Value },
    Removed { key: String },
    Replaced { value: Value },
}

impl WatchLine {
    fn from_change(change: &MirrorChange, document: &Document) -> Self {
        match change {
            MirrorChange::Set { key } => WatchLine::Set {
                key: key.clone(),
                value: document.get(key).cloned().unwrap_or(Value::Null),
            },
            MirrorChange::Removed { key } => WatchLine::Removed { key: key.clone() },
            MirrorChange::Replaced => WatchLine::Replaced {
                value: Value::Object(document.clone()),
            },
        }
    }
}

impl WatchArgs {
    pub async fn run(self, target: &Target) -> Result<()> {
        let state = SharedState::open(self.id.as_str(), target.options())
            .with_context(|| format!("failed to open document '{}'", self.id))?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<WatchLine>();
        state.subscribe(move |change, document| {
            let _ = line_tx.send(WatchLine::from_change(change, document));
        });

        print_line(&WatchLine::Snapshot {
            value: Value::Object(state.value()),
        })?;

        let mut seen = 0usize;
        loop {
            if self.count.is_some_and(|limit| seen >= limit) {
                break;
            }
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    print_line(&line)?;
                    seen += 1;
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for ctrl-c")?;
                    break;
                }
            }
        }

        state.dispose();
        Ok(())
    }
}

fn print_line(line: &WatchLine) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(line).context("failed to render watch event")?
    );
    Ok(())
}
