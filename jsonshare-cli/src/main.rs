//! jsonshare: inspect and edit JSON documents shared between processes.
//!
//! # Usage
//!
//! ```text
//! jsonshare [--dir <DIR>] [--lock-timeout-ms <MS>] get <id> [key]
//! jsonshare [--dir <DIR>] set <id> <key> <value>
//! jsonshare [--dir <DIR>] remove <id> <key>
//! jsonshare [--dir <DIR>] watch <id> [--count <N>]
//! jsonshare [--dir <DIR>] lock status|clear <id>
//! ```

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    edit::{RemoveArgs, SetArgs},
    get::GetArgs,
    lock::LockCommand,
    watch::WatchArgs,
    Target,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "jsonshare",
    version,
    about = "Read, write and watch JSON documents shared between processes",
    long_about = None,
)]
struct Cli {
    /// Directory holding shared documents (defaults to <tmp>/jsonshare).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// How long writes wait for the document lock.
    #[arg(long, global = true, default_value_t = 500)]
    lock_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a document, or one key of it, as JSON.
    Get(GetArgs),

    /// Set one key; the value is parsed as JSON, falling back to a string.
    Set(SetArgs),

    /// Delete one key.
    Remove(RemoveArgs),

    /// Stream changes to a document as JSON lines.
    Watch(WatchArgs),

    /// Inspect or clear the document's lock marker.
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let target = Target {
        directory: cli
            .dir
            .unwrap_or_else(jsonshare_core::paths::default_directory),
        lock_timeout: Duration::from_millis(cli.lock_timeout_ms),
    };
    tracing::debug!(dir = %target.directory.display(), "resolved document directory");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Get(args) => args.run(&target),
            Commands::Set(args) => args.run(&target).await,
            Commands::Remove(args) => args.run(&target).await,
            Commands::Watch(args) => args.run(&target).await,
            Commands::Lock { command } => commands::lock::run(command, &target),
        }
    })
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
