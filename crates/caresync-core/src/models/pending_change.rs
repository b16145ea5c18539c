//! Pending change queue model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityLocalId, EntityType};

/// Identifier for a queued change, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of mutation a queued change carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Lifecycle state of a queued change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeStatus {
    /// Waiting to be pushed (or waiting out a backoff delay)
    Pending,
    /// Currently in flight; at most one per entity at any instant
    Syncing,
    /// Acknowledged by the server
    Completed,
    /// Rejected with a conflict; blocked until the conflict resolves
    Failed,
    /// Retry budget exhausted; frozen until an operator intervenes
    RequiresIntervention,
}

impl ChangeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RequiresIntervention => "requiresIntervention",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "requiresIntervention" => Ok(Self::RequiresIntervention),
            other => Err(format!("unknown change status: {other}")),
        }
    }
}

/// A queued, not-yet-acknowledged local mutation awaiting push.
///
/// `base_version` is the server version the device last observed for the
/// entity; the server compares it against its current version to detect
/// concurrent writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Queue row identifier
    pub id: ChangeId,
    /// Mutation kind
    pub operation_type: OperationType,
    /// Entity kind
    pub entity_type: EntityType,
    /// Entity this change applies to
    pub entity_local_id: EntityLocalId,
    /// Payload snapshot taken at enqueue time
    pub payload: serde_json::Value,
    /// Server version observed when the change was made
    pub base_version: i64,
    /// Consecutive transport failures so far
    pub retry_count: u32,
    /// Queue lifecycle state
    pub status: ChangeStatus,
    /// Enqueue timestamp (adjusted time, Unix ms)
    pub created_at: i64,
    /// Last push attempt (Unix ms), None before the first attempt
    pub last_attempt_at: Option<i64>,
    /// Earliest time the next attempt may run (Unix ms); None means no
    /// backoff is in effect
    pub next_attempt_at: Option<i64>,
    /// Message from the most recent failure
    pub error_message: Option<String>,
}

impl PendingChange {
    /// Create a pending change for the given entity mutation.
    #[must_use]
    pub fn new(
        operation_type: OperationType,
        entity_type: EntityType,
        entity_local_id: EntityLocalId,
        payload: serde_json::Value,
        base_version: i64,
        created_at: i64,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            operation_type,
            entity_type,
            entity_local_id,
            payload,
            base_version,
            retry_count: 0,
            status: ChangeStatus::Pending,
            created_at,
            last_attempt_at: None,
            next_attempt_at: None,
            error_message: None,
        }
    }
}
