use crate::commands::common::AppContext;
use crate::error::CliError;

pub fn run_check(ctx: &AppContext) -> Result<(), CliError> {
    let stats = ctx.store.get_storage_stats()?;
    println!(
        "{} treatments, {} applicators, {} queued changes, {} unresolved conflicts",
        stats.treatments, stats.applicators, stats.queued_changes, stats.unresolved_conflicts,
    );

    let report = ctx.store.check_integrity()?;
    if report.is_clean() {
        println!("Integrity OK");
        return Ok(());
    }
    for id in &report.orphaned_changes {
        println!("orphaned queue entry: {id}");
    }
    for (entity_type, id) in &report.quarantined_entities {
        println!("unreadable {entity_type} record: {id}");
    }
    Ok(())
}
