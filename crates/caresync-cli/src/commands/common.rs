use std::path::PathBuf;
use std::sync::Arc;

use caresync_core::api::{HttpSyncApi, SyncApi};
use caresync_core::crypto::KEY_SIZE;
use caresync_core::{
    ClockConfig, ClockService, Conflict, ConflictResolver, EngineConfig, LocalStore,
    NetworkMonitor, PendingChange, ResolutionPolicy, StorePath, SyncEngine, SyncSummary,
};

use crate::cli::Cli;
use crate::error::CliError;

const ENV_DB_PATH: &str = "CARESYNC_DB";
const ENV_SERVER_URL: &str = "CARESYNC_SERVER_URL";
const ENV_KEY: &str = "CARESYNC_ENCRYPTION_KEY";

/// Everything a command needs, wired once per invocation.
pub struct AppContext {
    pub store: Arc<LocalStore>,
    pub engine: Arc<SyncEngine>,
    pub resolver: Arc<ConflictResolver>,
    pub api: Arc<dyn SyncApi>,
}

pub fn build_context(cli: &Cli) -> Result<AppContext, CliError> {
    let db_path = resolve_db_path(cli.db_path.clone());
    let server_url = cli
        .server_url
        .clone()
        .or_else(|| std::env::var(ENV_SERVER_URL).ok())
        .ok_or_else(|| CliError::Config(format!("set --server-url or {ENV_SERVER_URL}")))?;
    let key_hex = std::env::var(ENV_KEY).map_err(|_| {
        CliError::Config(format!(
            "set {ENV_KEY} to a {}-character hex key",
            KEY_SIZE * 2
        ))
    })?;
    let key = decode_hex_key(&key_hex)?;

    let store = Arc::new(LocalStore::new());
    store.initialize(&StorePath::File(db_path), &key)?;
    if let Some(device_id) = &cli.device_id {
        store.set_device_id(device_id)?;
    }

    let api: Arc<dyn SyncApi> = Arc::new(HttpSyncApi::new(server_url)?);
    let clock = Arc::new(ClockService::new(ClockConfig::default()));
    // The CLI runs on demand; assume the link is up and let the cycle
    // find out otherwise.
    let network = NetworkMonitor::with_initial(true);
    let resolver = Arc::new(ConflictResolver::new(
        Arc::clone(&store),
        Arc::clone(&api),
        ResolutionPolicy::admin_only(),
    ));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&api),
        clock,
        network,
        Arc::clone(&resolver),
        EngineConfig::default(),
    ));

    Ok(AppContext {
        store,
        engine,
        resolver,
        api,
    })
}

pub fn resolve_db_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var(ENV_DB_PATH).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("caresync.db"))
}

pub fn decode_hex_key(hex: &str) -> Result<[u8; KEY_SIZE], CliError> {
    let hex = hex.trim();
    if !hex.is_ascii() || hex.len() != KEY_SIZE * 2 {
        return Err(CliError::Config(format!(
            "encryption key must be {} hex characters",
            KEY_SIZE * 2
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| CliError::Config("encryption key is not valid hex".to_string()))?;
    }
    Ok(key)
}

pub fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms).map_or_else(
        || ms.to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_summary_lines(summary: &SyncSummary) -> Vec<String> {
    let mut lines = vec![
        format!("State: {}", summary.banner_text()),
        format!("Pending operations: {}", summary.pending_operations),
        format!("Open conflicts: {}", summary.open_conflicts),
        format!("Needs intervention: {}", summary.intervention_required),
    ];
    match summary.last_synced_at {
        Some(at) => lines.push(format!("Last synced: {}", format_timestamp(at))),
        None => lines.push("Last synced: never".to_string()),
    }
    if let Some(error) = &summary.last_error {
        lines.push(format!("Last error: {error}"));
    }
    lines
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|c| {
            format!(
                "{}  {} {}  local v{} vs server v{}  [{}]  detected {}",
                c.id,
                c.entity_type,
                c.entity_local_id,
                c.local.version,
                c.server.version,
                c.resolution_status.as_str(),
                format_timestamp(c.detected_at),
            )
        })
        .collect()
}

pub fn format_change_lines(changes: &[PendingChange]) -> Vec<String> {
    changes
        .iter()
        .map(|c| {
            let mut line = format!(
                "{}  {} {} {}  base v{}  retries {}  [{}]",
                c.id,
                c.operation_type.as_str(),
                c.entity_type,
                c.entity_local_id,
                c.base_version,
                c.retry_count,
                c.status.as_str(),
            );
            if let Some(error) = &c.error_message {
                line.push_str(&format!("  last error: {error}"));
            }
            line
        })
        .collect()
}
