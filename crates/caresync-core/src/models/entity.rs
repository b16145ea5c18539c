//! Local entity snapshot model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A device-generated identifier for a local entity, using UUID v7
/// (time-sortable). Immutable for the lifetime of the record, even after
/// the server assigns its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityLocalId(Uuid);

impl EntityLocalId {
    /// Create a new unique local ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntityLocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityLocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityLocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of record the sync core tracks. Each kind maps to its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Treatment,
    Applicator,
}

impl EntityType {
    /// `SQLite` table holding entities of this type
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Treatment => "treatments",
            Self::Applicator => "applicators",
        }
    }

    /// All entity types, in scan order
    #[must_use]
    pub const fn all() -> [Self; 2] {
        [Self::Treatment, Self::Applicator]
    }

    /// Wire name used by the sync protocol
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Treatment => "treatment",
            Self::Applicator => "applicator",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "treatment" => Ok(Self::Treatment),
            "applicator" => Ok(Self::Applicator),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Where an entity stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// Local state matches the last server acknowledgment
    Synced,
    /// Local edits exist that the server has not acknowledged
    Pending,
    /// A version mismatch was detected and is awaiting resolution
    Conflict,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Device-local copy of a treatment or applicator record.
///
/// The business attributes live in `payload` and are opaque to the sync
/// core; `version` is the optimistic-concurrency token last observed from
/// the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// Device-generated identifier, immutable
    pub local_id: EntityLocalId,
    /// Record kind
    pub entity_type: EntityType,
    /// Server-assigned identifier; None until the first successful push
    pub server_id: Option<String>,
    /// Server version last observed for this record (0 = never synced)
    pub version: i64,
    /// Full business attributes, opaque to the sync core
    pub payload: serde_json::Value,
    /// Sync state of this record
    pub sync_status: SyncStatus,
    /// Owner scope (device or user) used by `list_by_owner`
    pub owner: String,
    /// Last local modification, adjusted time (Unix ms)
    pub last_modified: i64,
    /// When the record was downloaded or captured (Unix ms)
    pub downloaded_at: i64,
    /// Local retention deadline (Unix ms)
    pub expires_at: i64,
}

impl LocalEntity {
    /// Create a locally-captured entity that has never been pushed.
    #[must_use]
    pub fn new_local(
        entity_type: EntityType,
        payload: serde_json::Value,
        owner: impl Into<String>,
        now: i64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            local_id: EntityLocalId::new(),
            entity_type,
            server_id: None,
            version: 0,
            payload,
            sync_status: SyncStatus::Pending,
            owner: owner.into(),
            last_modified: now,
            downloaded_at: now,
            expires_at: now + ttl_ms,
        }
    }

    /// Create an entity from a downloaded bundle record.
    #[must_use]
    pub fn from_download(
        entity_type: EntityType,
        server_id: impl Into<String>,
        version: i64,
        payload: serde_json::Value,
        owner: impl Into<String>,
        now: i64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            local_id: EntityLocalId::new(),
            entity_type,
            server_id: Some(server_id.into()),
            version,
            payload,
            sync_status: SyncStatus::Synced,
            owner: owner.into(),
            last_modified: now,
            downloaded_at: now,
            expires_at: now + ttl_ms,
        }
    }

    /// Whether the local retention deadline has passed.
    #[must_use]
    pub const fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}
