//! CareSync CLI - operator surface for the on-device sync core
//!
//! Inspect sync health, trigger cycles, review conflicts, and seed a
//! device from a server snapshot.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands, ConflictCommands};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caresync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let ctx = commands::common::build_context(&cli)?;

    match cli.command {
        Commands::Status { json, remote } => {
            commands::status::run_status(&ctx, json, remote).await?;
        }
        Commands::Sync => commands::sync::run_sync(&ctx).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { json, remote } => {
                commands::conflicts::run_list(&ctx, json, remote).await?;
            }
            ConflictCommands::Resolve { id, payload, by } => {
                commands::conflicts::run_resolve(&ctx, &id, &payload, &by).await?;
            }
        },
        Commands::Queue { json } => commands::queue::run_queue(&ctx, json)?,
        Commands::Bundle => commands::bundle::run_bundle(&ctx).await?,
        Commands::Check => commands::check::run_check(&ctx)?,
    }

    ctx.store.close()?;
    Ok(())
}
