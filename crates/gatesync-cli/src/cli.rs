use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gatesync_core::models::{UserStatus, UserType};
use gatesync_core::sync::ConflictResolution;

#[derive(Parser)]
#[command(name = "gatesync")]
#[command(about = "Inspect and operate a gatesync gate node")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Node database (defaults to GATESYNC_DB_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Base URL of the running node (defaults to GATESYNC_NODE_URL, then the bind address)
    #[arg(long, global = true, value_name = "URL")]
    pub node_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show sync status per peer and table
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and settle sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Run sync against the running node
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Manage credential holders
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// List recent access events
    Logs {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decide a scan at this node's gate
    Scan {
        /// RFID tag read by the scanner
        rfid_tag: String,
        /// Booth the scan came from
        #[arg(long)]
        booth: i64,
        /// Scanner device id
        #[arg(long)]
        device: Option<i64>,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List recorded conflicts
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle an open conflict
    Resolve {
        /// Conflict id
        id: i64,
        /// keep-local or accept-remote
        resolution: ConflictResolution,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Run a sync cycle now
    Trigger {
        /// Only this peer ordinal
        #[arg(long)]
        peer: Option<u32>,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Enrol a credential holder
    Add {
        /// RFID tag
        rfid_tag: String,
        #[arg(long)]
        name: Option<String>,
        /// National id number
        #[arg(long)]
        nic: Option<String>,
        /// Common, VIP or Backstage
        #[arg(long = "type", default_value = "Common")]
        user_type: UserType,
    },
    /// Enrol holders from a CSV file (rfid_tag,name,nic,user_type)
    Import {
        /// CSV file with a header row
        file: PathBuf,
    },
    /// List credential holders
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Change a holder's fields
    Set {
        /// User id or RFID tag
        user: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<UserStatus>,
        #[arg(long = "type")]
        user_type: Option<UserType>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Soft-delete a holder
    Delete {
        /// User id or RFID tag
        user: String,
    },
}
