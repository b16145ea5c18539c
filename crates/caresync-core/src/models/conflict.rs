//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityLocalId, EntityType};

/// Identifier for a recorded conflict, using UUID v7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a conflict stands in its resolution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStatus {
    /// Detected, no resolution attempted yet
    Pending,
    /// An automatic rule produced the winning state
    AutoResolved,
    /// No automatic rule applied; a human must decide
    AdminRequired,
    /// A winning payload has been accepted and written back
    Resolved,
}

impl ResolutionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AutoResolved => "autoResolved",
            Self::AdminRequired => "adminRequired",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for ResolutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "autoResolved" => Ok(Self::AutoResolved),
            "adminRequired" => Ok(Self::AdminRequired),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown resolution status: {other}")),
        }
    }
}

/// One side of a conflict: a payload plus the version it was observed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub version: i64,
    pub payload: serde_json::Value,
}

/// A detected divergence between the device's last-known version of an
/// entity and the server's current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict row identifier
    pub id: ConflictId,
    /// Entity kind
    pub entity_type: EntityType,
    /// Entity involved in the conflict
    pub entity_local_id: EntityLocalId,
    /// Device-side state at detection time
    pub local: VersionSnapshot,
    /// Server-side state at detection time
    pub server: VersionSnapshot,
    /// Resolution lifecycle state
    pub resolution_status: ResolutionStatus,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    /// Resolution timestamp (Unix ms), None while unresolved
    pub resolved_at: Option<i64>,
    /// Who resolved it ("auto" for rule-based resolutions)
    pub resolved_by: Option<String>,
}

impl Conflict {
    /// Record a freshly detected version mismatch.
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_local_id: EntityLocalId,
        local: VersionSnapshot,
        server: VersionSnapshot,
        detected_at: i64,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            entity_type,
            entity_local_id,
            local,
            server,
            resolution_status: ResolutionStatus::Pending,
            detected_at,
            resolved_at: None,
            resolved_by: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Conflict {
        Conflict::new(
            EntityType::Treatment,
            EntityLocalId::new(),
            VersionSnapshot {
                version: 1,
                payload: json!({"dose": 2}),
            },
            VersionSnapshot {
                version: 2,
                payload: json!({"dose": 3}),
            },
            1_000,
        )
    }

    #[test]
    fn test_new_conflict_starts_pending() {
        let conflict = sample();
        assert_eq!(conflict.resolution_status, ResolutionStatus::Pending);
        assert!(conflict.resolved_at.is_none());
        assert!(conflict.resolved_by.is_none());
    }

    #[test]
    fn test_resolution_status_round_trip() {
        for status in [
            ResolutionStatus::Pending,
            ResolutionStatus::AutoResolved,
            ResolutionStatus::AdminRequired,
            ResolutionStatus::Resolved,
        ] {
            let parsed: ResolutionStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
        }
    }
}
