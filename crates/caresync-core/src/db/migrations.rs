//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Apply a migration's statements inside a single transaction
fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", [])?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, []) {
            conn.execute("ROLLBACK", []).ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", []) {
        conn.execute("ROLLBACK", []).ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: entity tables, sync queue, conflicts
fn migrate_v1(conn: &Connection) -> Result<()> {
    let entity_table = |name: &str| {
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                local_id TEXT PRIMARY KEY,
                server_id TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                payload BLOB NOT NULL,
                sync_status TEXT NOT NULL,
                owner TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                downloaded_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )"
        )
    };

    let treatments = entity_table("treatments");
    let applicators = entity_table("applicators");

    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        treatments.as_str(),
        "CREATE INDEX IF NOT EXISTS idx_treatments_owner ON treatments(owner)",
        "CREATE INDEX IF NOT EXISTS idx_treatments_expires ON treatments(expires_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_treatments_server_id
            ON treatments(server_id) WHERE server_id IS NOT NULL",
        applicators.as_str(),
        "CREATE INDEX IF NOT EXISTS idx_applicators_owner ON applicators(owner)",
        "CREATE INDEX IF NOT EXISTS idx_applicators_expires ON applicators(expires_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_applicators_server_id
            ON applicators(server_id) WHERE server_id IS NOT NULL",
        // Pending change queue
        "CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            operation_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_local_id TEXT NOT NULL,
            payload BLOB NOT NULL,
            base_version INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_attempt_at INTEGER,
            error_message TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity
            ON sync_queue(entity_type, entity_local_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_created
            ON sync_queue(status, created_at)",
        // One in-flight change per entity at any instant
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_queue_one_syncing
            ON sync_queue(entity_type, entity_local_id) WHERE status = 'syncing'",
        // Conflicts
        "CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_local_id TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            local_payload BLOB NOT NULL,
            server_version INTEGER NOT NULL,
            server_payload BLOB NOT NULL,
            resolution_status TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolved_by TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_entity
            ON conflicts(entity_type, entity_local_id)",
        "CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts(resolution_status)",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: key/value meta table (device id, pull watermark)
fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: retry deadline on queued changes
fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE sync_queue ADD COLUMN next_attempt_at INTEGER",
        "INSERT INTO schema_version (version) VALUES (3)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
