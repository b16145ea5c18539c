use crate::commands::common::AppContext;
use crate::error::CliError;

pub async fn run_bundle(ctx: &AppContext) -> Result<(), CliError> {
    let seeded = ctx.engine.download_bundle().await?;
    println!("Downloaded {seeded} new records");
    Ok(())
}
