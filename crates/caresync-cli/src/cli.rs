use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "caresync")]
#[command(about = "Offline-first sync tooling for CareSync devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Base URL of the sync server
    #[arg(long, global = true, value_name = "URL")]
    pub server_url: Option<String>,

    /// Override the stored device identifier (provisioning)
    #[arg(long, global = true, value_name = "ID")]
    pub device_id: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show sync health for this device
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Also query the server's view of this device
        #[arg(long)]
        remote: bool,
    },
    /// Run one push/pull cycle now
    Sync,
    /// Inspect and resolve version conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// List queued changes awaiting push or operator intervention
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Seed the local store from a full server snapshot
    Bundle,
    /// Verify local storage consistency
    Check,
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts awaiting review
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// List the server's review queue instead of the local one
        #[arg(long)]
        remote: bool,
    },
    /// Resolve a conflict with the given winning payload
    Resolve {
        /// Conflict id
        id: String,
        /// Winning payload as a JSON object
        #[arg(long, value_name = "JSON")]
        payload: String,
        /// Reviewer recorded on the resolution
        #[arg(long, value_name = "NAME")]
        by: String,
    },
}
