use crate::commands::common::{format_change_lines, AppContext};
use crate::error::CliError;

pub fn run_queue(ctx: &AppContext, as_json: bool) -> Result<(), CliError> {
    let mut changes = ctx.store.list_pending()?;
    changes.extend(ctx.store.list_intervention_required()?);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for line in format_change_lines(&changes) {
        println!("{line}");
    }
    Ok(())
}
