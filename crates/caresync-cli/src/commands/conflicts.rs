use caresync_core::models::{now_millis, ConflictId};

use crate::commands::common::{format_conflict_lines, AppContext};
use crate::error::CliError;

pub async fn run_list(ctx: &AppContext, as_json: bool, remote: bool) -> Result<(), CliError> {
    if remote {
        let conflicts = ctx.api.list_conflicts().await?;
        if as_json {
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
            return Ok(());
        }
        if conflicts.is_empty() {
            println!("No conflicts on the server review queue.");
            return Ok(());
        }
        for c in &conflicts {
            println!(
                "{}  {} {}  local v{} vs server v{}",
                c.id, c.entity_type, c.entity_id, c.local_version, c.server_version,
            );
        }
        return Ok(());
    }

    let conflicts = ctx.store.list_conflicts()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No unresolved conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    ctx: &AppContext,
    id: &str,
    payload: &str,
    resolved_by: &str,
) -> Result<(), CliError> {
    let conflict_id: ConflictId = id
        .parse()
        .map_err(|_| CliError::InvalidConflictId(id.to_string()))?;
    // The payload argument is either inline JSON or a path to a file
    // holding it.
    let text = match std::fs::read_to_string(payload) {
        Ok(contents) => contents,
        Err(_) => payload.to_string(),
    };
    let winning: serde_json::Value = serde_json::from_str(&text)?;
    if !winning.is_object() {
        return Err(CliError::PayloadNotObject);
    }

    ctx.resolver
        .resolve_manual(&conflict_id, winning, resolved_by, now_millis())
        .await?;
    println!("Conflict {conflict_id} resolved by {resolved_by}");
    Ok(())
}
