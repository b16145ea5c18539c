//! Local Store: sole owner of on-device persisted state.
//!
//! Every other component (Sync Engine, Conflict Resolver, operator
//! surface) reads and mutates device state only through this object.
//! Payload columns are encrypted at rest; until `initialize` has supplied
//! key material the store fails closed.

mod stats;

pub use stats::{IntegrityReport, StorageStats};

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, OptionalExtension, Row};

use crate::crypto::PayloadCipher;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    ChangeId, ChangeStatus, Conflict, ConflictId, EntityLocalId, EntityType, LocalEntity,
    OperationType, PendingChange, ResolutionStatus, SyncStatus, VersionSnapshot,
};

const META_DEVICE_ID: &str = "device_id";
const META_WATERMARK: &str = "pull_watermark";
const META_LAST_SYNCED: &str = "last_synced_at";

/// Where the store keeps its database
#[derive(Debug, Clone, Default)]
pub enum StorePath {
    /// In-memory database, gone on close (tests)
    #[default]
    InMemory,
    /// On-disk database file
    File(PathBuf),
}

struct StoreInner {
    db: Database,
    cipher: PayloadCipher,
}

/// Durable, encrypted, per-device storage for entity snapshots, the
/// pending-change queue, and conflict records.
///
/// Constructed once, `initialize`d with key material, and passed by
/// reference to the Sync Engine and Conflict Resolver. Access to the
/// single connection is serialized internally; writes are atomic per
/// entity key and the last writer wins at this layer — ordering of
/// writers is the Sync Engine's job.
pub struct LocalStore {
    inner: Mutex<Option<StoreInner>>,
}

impl LocalStore {
    /// Create a store with no backing database yet. All operations fail
    /// with a storage error until `initialize` is called.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Open the database and install the payload encryption key.
    pub fn initialize(&self, path: &StorePath, encryption_key: &[u8]) -> Result<()> {
        let cipher = PayloadCipher::new(encryption_key)?;
        let db = match path {
            StorePath::InMemory => Database::open_in_memory()?,
            StorePath::File(p) => Database::open(p)?,
        };

        let mut guard = self.lock()?;
        if guard.is_some() {
            return Err(Error::Storage("store already initialized".to_string()));
        }
        *guard = Some(StoreInner { db, cipher });
        tracing::info!("local store initialized");
        Ok(())
    }

    /// Close the database. Further operations fail until re-initialized.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        *guard = None;
        tracing::info!("local store closed");
        Ok(())
    }

    /// Whether the store holds key material and will accept writes.
    pub fn is_encryption_ready(&self) -> bool {
        self.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<StoreInner>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("store mutex poisoned".to_string()))
    }

    fn with_inner<T>(&self, f: impl FnOnce(&StoreInner) -> Result<T>) -> Result<T> {
        let guard = self.lock()?;
        let inner = guard
            .as_ref()
            .ok_or_else(|| Error::Storage("store not initialized".to_string()))?;
        f(inner)
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Insert or replace an entity snapshot. Atomic per `local_id`.
    pub fn save_entity(&self, entity: &LocalEntity) -> Result<()> {
        self.with_inner(|inner| {
            let payload = inner.cipher.encrypt_json(&entity.payload)?;
            let sql = format!(
                "INSERT OR REPLACE INTO {}
                 (local_id, server_id, version, payload, sync_status, owner,
                  last_modified, downloaded_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                entity.entity_type.table()
            );
            inner.db.connection().execute(
                &sql,
                params![
                    entity.local_id.as_str(),
                    entity.server_id,
                    entity.version,
                    payload,
                    entity.sync_status.as_str(),
                    entity.owner,
                    entity.last_modified,
                    entity.downloaded_at,
                    entity.expires_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch an entity by its local ID.
    pub fn get_entity(
        &self,
        entity_type: EntityType,
        local_id: &EntityLocalId,
    ) -> Result<Option<LocalEntity>> {
        self.with_inner(|inner| {
            let sql = format!(
                "SELECT local_id, server_id, version, payload, sync_status, owner,
                        last_modified, downloaded_at, expires_at
                 FROM {} WHERE local_id = ?1",
                entity_type.table()
            );
            let row = inner
                .db
                .connection()
                .query_row(&sql, params![local_id.as_str()], |row| {
                    raw_entity(entity_type, row)
                })
                .optional()?;

            row.map(|raw| raw.decrypt(&inner.cipher)).transpose()
        })
    }

    /// Fetch an entity by the server's identifier, if it has one locally.
    pub fn get_entity_by_server_id(
        &self,
        entity_type: EntityType,
        server_id: &str,
    ) -> Result<Option<LocalEntity>> {
        self.with_inner(|inner| {
            let sql = format!(
                "SELECT local_id, server_id, version, payload, sync_status, owner,
                        last_modified, downloaded_at, expires_at
                 FROM {} WHERE server_id = ?1",
                entity_type.table()
            );
            let row = inner
                .db
                .connection()
                .query_row(&sql, params![server_id], |row| raw_entity(entity_type, row))
                .optional()?;

            row.map(|raw| raw.decrypt(&inner.cipher)).transpose()
        })
    }

    /// List all entities of a type for an owner, most recently modified
    /// first. Rows whose payload fails to decrypt are quarantined: logged
    /// and skipped, never fatal to the scan.
    pub fn list_by_owner(&self, entity_type: EntityType, owner: &str) -> Result<Vec<LocalEntity>> {
        self.with_inner(|inner| {
            let sql = format!(
                "SELECT local_id, server_id, version, payload, sync_status, owner,
                        last_modified, downloaded_at, expires_at
                 FROM {} WHERE owner = ?1 ORDER BY last_modified DESC",
                entity_type.table()
            );
            let mut stmt = inner.db.connection().prepare(&sql)?;
            let raws = stmt
                .query_map(params![owner], |row| raw_entity(entity_type, row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut entities = Vec::with_capacity(raws.len());
            for raw in raws {
                let local_id = raw.local_id.clone();
                match raw.decrypt(&inner.cipher) {
                    Ok(entity) => entities.push(entity),
                    Err(e) => {
                        tracing::warn!(local_id = %local_id, "quarantined unreadable row: {e}");
                    }
                }
            }
            Ok(entities)
        })
    }

    /// Remove an entity row.
    pub fn delete_entity(&self, entity_type: EntityType, local_id: &EntityLocalId) -> Result<()> {
        self.with_inner(|inner| {
            let sql = format!("DELETE FROM {} WHERE local_id = ?1", entity_type.table());
            inner
                .db
                .connection()
                .execute(&sql, params![local_id.as_str()])?;
            Ok(())
        })
    }

    /// Whether an entity's retention deadline has passed.
    pub fn is_expired(
        &self,
        entity_type: EntityType,
        local_id: &EntityLocalId,
        now: i64,
    ) -> Result<bool> {
        let entity = self
            .get_entity(entity_type, local_id)?
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;
        Ok(entity.is_expired(now))
    }

    // ------------------------------------------------------------------
    // Pending change queue
    // ------------------------------------------------------------------

    /// Append a change to the queue.
    pub fn enqueue_change(&self, change: &PendingChange) -> Result<()> {
        self.with_inner(|inner| {
            let payload = inner.cipher.encrypt_json(&change.payload)?;
            inner.db.connection().execute(
                "INSERT INTO sync_queue
                 (id, operation_type, entity_type, entity_local_id, payload,
                  base_version, retry_count, status, created_at, last_attempt_at,
                  next_attempt_at, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    change.id.as_str(),
                    change.operation_type.as_str(),
                    change.entity_type.as_str(),
                    change.entity_local_id.as_str(),
                    payload,
                    change.base_version,
                    change.retry_count,
                    change.status.as_str(),
                    change.created_at,
                    change.last_attempt_at,
                    change.next_attempt_at,
                    change.error_message,
                ],
            )?;
            Ok(())
        })
    }

    /// All changes with status `pending`, FIFO by `created_at` so edits to
    /// one entity replay in causal order.
    pub fn list_pending(&self) -> Result<Vec<PendingChange>> {
        self.list_changes_where("status = 'pending'")
    }

    /// Changes frozen after exhausting their retry budget.
    pub fn list_intervention_required(&self) -> Result<Vec<PendingChange>> {
        self.list_changes_where("status = 'requiresIntervention'")
    }

    /// Return in-flight changes to the queue. A `syncing` row outlives its
    /// push attempt only when the process died mid-cycle; until it is
    /// flipped back it would sit in neither the pending nor the
    /// intervention queue.
    pub fn recover_inflight_changes(&self) -> Result<usize> {
        self.with_inner(|inner| {
            let rows = inner.db.connection().execute(
                "UPDATE sync_queue SET status = 'pending' WHERE status = 'syncing'",
                [],
            )?;
            if rows > 0 {
                tracing::warn!("recovered {rows} in-flight changes from an interrupted cycle");
            }
            Ok(rows)
        })
    }

    /// Every queued change for one entity, oldest first.
    pub fn list_changes_for_entity(
        &self,
        entity_type: EntityType,
        local_id: &EntityLocalId,
    ) -> Result<Vec<PendingChange>> {
        self.with_inner(|inner| {
            let mut stmt = inner.db.connection().prepare(
                "SELECT id, operation_type, entity_type, entity_local_id, payload,
                        base_version, retry_count, status, created_at, last_attempt_at,
                        next_attempt_at, error_message
                 FROM sync_queue
                 WHERE entity_type = ?1 AND entity_local_id = ?2
                 ORDER BY created_at ASC",
            )?;
            let raws = stmt
                .query_map(params![entity_type.as_str(), local_id.as_str()], raw_change)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(|raw| raw.decrypt(&inner.cipher)).collect()
        })
    }

    /// Current state of one queued change.
    pub fn get_change(&self, id: &ChangeId) -> Result<Option<PendingChange>> {
        self.with_inner(|inner| {
            let raw = inner
                .db
                .connection()
                .query_row(
                    "SELECT id, operation_type, entity_type, entity_local_id, payload,
                            base_version, retry_count, status, created_at, last_attempt_at,
                            next_attempt_at, error_message
                     FROM sync_queue WHERE id = ?1",
                    params![id.as_str()],
                    raw_change,
                )
                .optional()?;
            raw.map(|raw| raw.decrypt(&inner.cipher)).transpose()
        })
    }

    /// Move the base version of an entity's still-pending changes forward
    /// after an earlier change for it was acknowledged. Without this, the
    /// second of two sequential local edits would replay against the
    /// server with the version observed before the first edit landed.
    pub fn rebase_changes_for_entity(
        &self,
        entity_type: EntityType,
        local_id: &EntityLocalId,
        base_version: i64,
    ) -> Result<usize> {
        self.with_inner(|inner| {
            let rows = inner.db.connection().execute(
                "UPDATE sync_queue SET base_version = ?3
                 WHERE entity_type = ?1 AND entity_local_id = ?2
                   AND status = 'pending' AND base_version < ?3",
                params![entity_type.as_str(), local_id.as_str(), base_version],
            )?;
            Ok(rows)
        })
    }

    fn list_changes_where(&self, predicate: &str) -> Result<Vec<PendingChange>> {
        self.with_inner(|inner| {
            let sql = format!(
                "SELECT id, operation_type, entity_type, entity_local_id, payload,
                        base_version, retry_count, status, created_at, last_attempt_at,
                        next_attempt_at, error_message
                 FROM sync_queue WHERE {predicate} ORDER BY created_at ASC"
            );
            let mut stmt = inner.db.connection().prepare(&sql)?;
            let raws = stmt
                .query_map([], raw_change)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(|raw| raw.decrypt(&inner.cipher)).collect()
        })
    }

    /// Number of not-yet-acknowledged changes (pending or in flight).
    pub fn count_pending(&self) -> Result<u64> {
        self.with_inner(|inner| {
            let count: i64 = inner.db.connection().query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'syncing', 'failed')",
                [],
                |row| row.get(0),
            )?;
            Ok(count.unsigned_abs())
        })
    }

    /// Persist updated queue bookkeeping (status, retries, error message).
    pub fn update_change(&self, change: &PendingChange) -> Result<()> {
        self.with_inner(|inner| {
            let rows = inner.db.connection().execute(
                "UPDATE sync_queue
                 SET retry_count = ?2, status = ?3, last_attempt_at = ?4,
                     next_attempt_at = ?5, error_message = ?6
                 WHERE id = ?1",
                params![
                    change.id.as_str(),
                    change.retry_count,
                    change.status.as_str(),
                    change.last_attempt_at,
                    change.next_attempt_at,
                    change.error_message,
                ],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(change.id.to_string()));
            }
            Ok(())
        })
    }

    /// Remove an acknowledged (or operator-discarded) change.
    pub fn remove_change(&self, id: &ChangeId) -> Result<()> {
        self.with_inner(|inner| {
            inner
                .db
                .connection()
                .execute("DELETE FROM sync_queue WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        })
    }

    /// Whether any queued change still references the entity.
    pub fn has_changes_for_entity(
        &self,
        entity_type: EntityType,
        local_id: &EntityLocalId,
    ) -> Result<bool> {
        self.with_inner(|inner| {
            let count: i64 = inner.db.connection().query_row(
                "SELECT COUNT(*) FROM sync_queue
                 WHERE entity_type = ?1 AND entity_local_id = ?2",
                params![entity_type.as_str(), local_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Record a detected conflict.
    pub fn add_conflict(&self, conflict: &Conflict) -> Result<()> {
        self.with_inner(|inner| {
            let local_payload = inner.cipher.encrypt_json(&conflict.local.payload)?;
            let server_payload = inner.cipher.encrypt_json(&conflict.server.payload)?;
            inner.db.connection().execute(
                "INSERT INTO conflicts
                 (id, entity_type, entity_local_id, local_version, local_payload,
                  server_version, server_payload, resolution_status, detected_at,
                  resolved_at, resolved_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    conflict.id.as_str(),
                    conflict.entity_type.as_str(),
                    conflict.entity_local_id.as_str(),
                    conflict.local.version,
                    local_payload,
                    conflict.server.version,
                    server_payload,
                    conflict.resolution_status.as_str(),
                    conflict.detected_at,
                    conflict.resolved_at,
                    conflict.resolved_by,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch a conflict by ID.
    pub fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let found = self
            .list_conflicts_where("id = ?1", params![id.as_str()])?
            .into_iter()
            .next();
        Ok(found)
    }

    /// All unresolved conflicts, oldest first.
    pub fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        self.list_conflicts_where("resolution_status != 'resolved'", params![])
    }

    /// Conflicts waiting on a human decision.
    pub fn list_admin_required_conflicts(&self) -> Result<Vec<Conflict>> {
        self.list_conflicts_where("resolution_status = 'adminRequired'", params![])
    }

    /// Unresolved conflicts touching one entity.
    pub fn list_conflicts_for_entity(
        &self,
        entity_type: EntityType,
        local_id: &EntityLocalId,
    ) -> Result<Vec<Conflict>> {
        self.list_conflicts_where(
            "resolution_status != 'resolved' AND entity_type = ?1 AND entity_local_id = ?2",
            params![entity_type.as_str(), local_id.as_str()],
        )
    }

    fn list_conflicts_where(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Conflict>> {
        self.with_inner(|inner| {
            let sql = format!(
                "SELECT id, entity_type, entity_local_id, local_version, local_payload,
                        server_version, server_payload, resolution_status, detected_at,
                        resolved_at, resolved_by
                 FROM conflicts WHERE {predicate} ORDER BY detected_at ASC"
            );
            let mut stmt = inner.db.connection().prepare(&sql)?;
            let raws = stmt
                .query_map(args, raw_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(|raw| raw.decrypt(&inner.cipher)).collect()
        })
    }

    /// Persist updated resolution state.
    pub fn update_conflict(&self, conflict: &Conflict) -> Result<()> {
        self.with_inner(|inner| {
            let rows = inner.db.connection().execute(
                "UPDATE conflicts
                 SET resolution_status = ?2, resolved_at = ?3, resolved_by = ?4
                 WHERE id = ?1",
                params![
                    conflict.id.as_str(),
                    conflict.resolution_status.as_str(),
                    conflict.resolved_at,
                    conflict.resolved_by,
                ],
            )?;
            if rows == 0 {
                return Err(Error::NotFound(conflict.id.to_string()));
            }
            Ok(())
        })
    }

    /// Remove a conflict record.
    pub fn remove_conflict(&self, id: &ConflictId) -> Result<()> {
        self.with_inner(|inner| {
            inner
                .db
                .connection()
                .execute("DELETE FROM conflicts WHERE id = ?1", params![id.as_str()])?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Meta
    // ------------------------------------------------------------------

    /// This device's stable identifier, generated on first access.
    pub fn device_id(&self) -> Result<String> {
        if let Some(existing) = self.get_meta(META_DEVICE_ID)? {
            return Ok(existing);
        }
        let id = uuid::Uuid::now_v7().to_string();
        self.set_meta(META_DEVICE_ID, &id)?;
        Ok(id)
    }

    /// Set the device identifier at provisioning time, before the first
    /// sync. The server keys replay detection on it.
    pub fn set_device_id(&self, device_id: &str) -> Result<()> {
        if device_id.trim().is_empty() {
            return Err(Error::Validation("device id must not be empty".to_string()));
        }
        self.set_meta(META_DEVICE_ID, device_id.trim())
    }

    /// Server watermark the next pull should resume from.
    pub fn pull_watermark(&self) -> Result<i64> {
        Ok(self
            .get_meta(META_WATERMARK)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Persist the pull watermark.
    pub fn set_pull_watermark(&self, watermark: i64) -> Result<()> {
        self.set_meta(META_WATERMARK, &watermark.to_string())
    }

    /// Timestamp of the last fully completed sync cycle, if any.
    pub fn last_synced_at(&self) -> Result<Option<i64>> {
        Ok(self.get_meta(META_LAST_SYNCED)?.and_then(|v| v.parse().ok()))
    }

    /// Record a completed sync cycle.
    pub fn set_last_synced_at(&self, at: i64) -> Result<()> {
        self.set_meta(META_LAST_SYNCED, &at.to_string())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_inner(|inner| {
            let value = inner
                .db
                .connection()
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_inner(|inner| {
            inner.db.connection().execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Purge fully-synced entities past their retention deadline.
    ///
    /// An entity referenced by any queued change is never purged, whatever
    /// its age; unsynced data cannot be lost to TTL.
    pub fn cleanup_expired(&self, now: i64) -> Result<usize> {
        self.with_inner(|inner| {
            let mut purged = 0;
            for entity_type in EntityType::all() {
                let sql = format!(
                    "DELETE FROM {} WHERE expires_at < ?1 AND local_id NOT IN (
                         SELECT entity_local_id FROM sync_queue WHERE entity_type = ?2
                     )",
                    entity_type.table()
                );
                purged += inner
                    .db
                    .connection()
                    .execute(&sql, params![now, entity_type.as_str()])?;
            }
            if purged > 0 {
                tracing::debug!("cleanup purged {purged} expired entities");
            }
            Ok(purged)
        })
    }

    /// Row counts across all tables.
    pub fn get_storage_stats(&self) -> Result<StorageStats> {
        self.with_inner(|inner| {
            let conn = inner.db.connection();
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n.unsigned_abs())
            };
            Ok(StorageStats {
                treatments: count("SELECT COUNT(*) FROM treatments")?,
                applicators: count("SELECT COUNT(*) FROM applicators")?,
                queued_changes: count("SELECT COUNT(*) FROM sync_queue")?,
                unresolved_conflicts: count(
                    "SELECT COUNT(*) FROM conflicts WHERE resolution_status != 'resolved'",
                )?,
            })
        })
    }

    /// Scan for queue rows referencing a missing entity and for entity
    /// rows whose payload no longer decrypts. Both are reported, never
    /// silently dropped.
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        self.with_inner(|inner| {
            let conn = inner.db.connection();
            let mut report = IntegrityReport::default();

            for entity_type in EntityType::all() {
                let sql = format!(
                    "SELECT id FROM sync_queue
                     WHERE entity_type = ?1 AND entity_local_id NOT IN (
                         SELECT local_id FROM {}
                     )",
                    entity_type.table()
                );
                let mut stmt = conn.prepare(&sql)?;
                let ids = stmt
                    .query_map(params![entity_type.as_str()], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                report.orphaned_changes.extend(ids);

                let sql = format!("SELECT local_id, payload FROM {}", entity_type.table());
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (local_id, payload) in rows {
                    if inner.cipher.decrypt(&payload).is_err() {
                        report
                            .quarantined_entities
                            .push((entity_type, local_id));
                    }
                }
            }

            if !report.is_clean() {
                tracing::warn!(
                    orphaned = report.orphaned_changes.len(),
                    quarantined = report.quarantined_entities.len(),
                    "integrity scan found problems"
                );
            }
            Ok(report)
        })
    }

    /// Wipe every table. Local cleanup only; nothing is pushed.
    pub fn clear_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            let conn = inner.db.connection();
            for table in ["treatments", "applicators", "sync_queue", "conflicts", "meta"] {
                conn.execute(&format!("DELETE FROM {table}"), [])?;
            }
            tracing::info!("local store cleared");
            Ok(())
        })
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------
// Row parsing: raw rows carry ciphertext, decrypted outside rusqlite's
// closure so crypto failures map to our error type per row.
// ----------------------------------------------------------------------

struct RawEntity {
    entity_type: EntityType,
    local_id: String,
    server_id: Option<String>,
    version: i64,
    payload: Vec<u8>,
    sync_status: String,
    owner: String,
    last_modified: i64,
    downloaded_at: i64,
    expires_at: i64,
}

impl RawEntity {
    fn decrypt(self, cipher: &PayloadCipher) -> Result<LocalEntity> {
        Ok(LocalEntity {
            local_id: self
                .local_id
                .parse()
                .map_err(|_| Error::Storage(format!("bad local_id: {}", self.local_id)))?,
            entity_type: self.entity_type,
            server_id: self.server_id,
            version: self.version,
            payload: cipher.decrypt_json(&self.payload)?,
            sync_status: self
                .sync_status
                .parse()
                .map_err(Error::Storage)?,
            owner: self.owner,
            last_modified: self.last_modified,
            downloaded_at: self.downloaded_at,
            expires_at: self.expires_at,
        })
    }
}

fn raw_entity(entity_type: EntityType, row: &Row<'_>) -> rusqlite::Result<RawEntity> {
    Ok(RawEntity {
        entity_type,
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        version: row.get(2)?,
        payload: row.get(3)?,
        sync_status: row.get(4)?,
        owner: row.get(5)?,
        last_modified: row.get(6)?,
        downloaded_at: row.get(7)?,
        expires_at: row.get(8)?,
    })
}

struct RawChange {
    id: String,
    operation_type: String,
    entity_type: String,
    entity_local_id: String,
    payload: Vec<u8>,
    base_version: i64,
    retry_count: u32,
    status: String,
    created_at: i64,
    last_attempt_at: Option<i64>,
    next_attempt_at: Option<i64>,
    error_message: Option<String>,
}

impl RawChange {
    fn decrypt(self, cipher: &PayloadCipher) -> Result<PendingChange> {
        Ok(PendingChange {
            id: self
                .id
                .parse()
                .map_err(|_| Error::Storage(format!("bad change id: {}", self.id)))?,
            operation_type: self.operation_type.parse().map_err(Error::Storage)?,
            entity_type: self.entity_type.parse().map_err(Error::Storage)?,
            entity_local_id: self
                .entity_local_id
                .parse()
                .map_err(|_| Error::Storage(format!("bad entity id: {}", self.entity_local_id)))?,
            payload: cipher.decrypt_json(&self.payload)?,
            base_version: self.base_version,
            retry_count: self.retry_count,
            status: self.status.parse().map_err(Error::Storage)?,
            created_at: self.created_at,
            last_attempt_at: self.last_attempt_at,
            next_attempt_at: self.next_attempt_at,
            error_message: self.error_message,
        })
    }
}

fn raw_change(row: &Row<'_>) -> rusqlite::Result<RawChange> {
    Ok(RawChange {
        id: row.get(0)?,
        operation_type: row.get(1)?,
        entity_type: row.get(2)?,
        entity_local_id: row.get(3)?,
        payload: row.get(4)?,
        base_version: row.get(5)?,
        retry_count: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        last_attempt_at: row.get(9)?,
        next_attempt_at: row.get(10)?,
        error_message: row.get(11)?,
    })
}

struct RawConflict {
    id: String,
    entity_type: String,
    entity_local_id: String,
    local_version: i64,
    local_payload: Vec<u8>,
    server_version: i64,
    server_payload: Vec<u8>,
    resolution_status: String,
    detected_at: i64,
    resolved_at: Option<i64>,
    resolved_by: Option<String>,
}

impl RawConflict {
    fn decrypt(self, cipher: &PayloadCipher) -> Result<Conflict> {
        Ok(Conflict {
            id: self
                .id
                .parse()
                .map_err(|_| Error::Storage(format!("bad conflict id: {}", self.id)))?,
            entity_type: self.entity_type.parse().map_err(Error::Storage)?,
            entity_local_id: self
                .entity_local_id
                .parse()
                .map_err(|_| Error::Storage(format!("bad entity id: {}", self.entity_local_id)))?,
            local: VersionSnapshot {
                version: self.local_version,
                payload: cipher.decrypt_json(&self.local_payload)?,
            },
            server: VersionSnapshot {
                version: self.server_version,
                payload: cipher.decrypt_json(&self.server_payload)?,
            },
            resolution_status: self.resolution_status.parse().map_err(Error::Storage)?,
            detected_at: self.detected_at,
            resolved_at: self.resolved_at,
            resolved_by: self.resolved_by,
        })
    }
}

fn raw_conflict(row: &Row<'_>) -> rusqlite::Result<RawConflict> {
    Ok(RawConflict {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_local_id: row.get(2)?,
        local_version: row.get(3)?,
        local_payload: row.get(4)?,
        server_version: row.get(5)?,
        server_payload: row.get(6)?,
        resolution_status: row.get(7)?,
        detected_at: row.get(8)?,
        resolved_at: row.get(9)?,
        resolved_by: row.get(10)?,
    })
}
