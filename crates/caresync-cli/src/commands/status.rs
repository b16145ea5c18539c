use crate::commands::common::{format_summary_lines, AppContext};
use crate::error::CliError;

pub async fn run_status(ctx: &AppContext, as_json: bool, remote: bool) -> Result<(), CliError> {
    let summary = ctx.engine.summary()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for line in format_summary_lines(&summary) {
            println!("{line}");
        }
    }

    if remote {
        let device_id = ctx.store.device_id()?;
        let server = ctx.api.status(&device_id).await?;
        println!(
            "Server view: {} outstanding operations, {} open conflicts",
            server.outstanding_operations, server.open_conflicts,
        );
    }
    Ok(())
}
