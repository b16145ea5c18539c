use caresync_core::CycleOutcome;

use crate::commands::common::AppContext;
use crate::error::CliError;

pub async fn run_sync(ctx: &AppContext) -> Result<(), CliError> {
    match ctx.engine.sync_now().await? {
        CycleOutcome::Completed(stats) => {
            println!(
                "Sync completed: {} pushed, {} pulled, {} conflicts, {} retried, {} frozen, {} purged",
                stats.pushed, stats.pulled, stats.conflicts, stats.retried, stats.frozen, stats.purged,
            );
        }
        CycleOutcome::Offline => println!("Offline; nothing attempted"),
        CycleOutcome::AuthPaused => println!("Sync paused: re-authentication required"),
        CycleOutcome::RateLimited => println!("Server cool-down in effect; try again later"),
        CycleOutcome::Coalesced => println!("A sync cycle is already running"),
    }
    Ok(())
}
