//! gatesync CLI - operator tooling for a gate node
//!
//! Reads and writes go straight to the node's database; `sync trigger` asks
//! the running node over HTTP.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands, ConflictCommands, SyncCommands, UserCommands};
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::logs::run_logs;
use crate::commands::scan::run_scan;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync_trigger;
use crate::commands::users::{
    build_patch, run_users_add, run_users_delete, run_users_import, run_users_list, run_users_set,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "gatesync_core=warn".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db_path.as_deref();

    match cli.command {
        Commands::Status { json } => run_status(json, db_path)?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { all, limit, json } => {
                run_conflicts_list(all, limit, json, db_path)?;
            }
            ConflictCommands::Resolve { id, resolution } => {
                run_conflicts_resolve(id, resolution, db_path)?;
            }
        },
        Commands::Sync { command } => match command {
            SyncCommands::Trigger { peer } => {
                run_sync_trigger(peer, cli.node_url, db_path).await?;
            }
        },
        Commands::Users { command } => match command {
            UserCommands::Add {
                rfid_tag,
                name,
                nic,
                user_type,
            } => run_users_add(&rfid_tag, name, nic, user_type, db_path)?,
            UserCommands::Import { file } => run_users_import(&file, db_path)?,
            UserCommands::List { limit, json } => run_users_list(limit, json, db_path)?,
            UserCommands::Set {
                user,
                name,
                status,
                user_type,
                active,
            } => {
                let patch = build_patch(name, status, user_type, active)?;
                run_users_set(&user, &patch, db_path)?;
            }
            UserCommands::Delete { user } => run_users_delete(&user, db_path)?,
        },
        Commands::Logs { limit, json } => run_logs(limit, json, db_path)?,
        Commands::Scan {
            rfid_tag,
            booth,
            device,
        } => run_scan(&rfid_tag, booth, device, db_path)?,
    }

    Ok(())
}
