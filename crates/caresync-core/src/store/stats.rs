//! Storage statistics and integrity reporting

use serde::Serialize;

use crate::models::EntityType;

/// Row counts across the store's tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub treatments: u64,
    pub applicators: u64,
    pub queued_changes: u64,
    pub unresolved_conflicts: u64,
}

impl StorageStats {
    /// Total entity rows on the device
    #[must_use]
    pub const fn total_entities(&self) -> u64 {
        self.treatments + self.applicators
    }
}

/// Result of an integrity scan.
///
/// Problems are reported for an operator to act on; the scan itself never
/// deletes or mutates rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    /// Queue rows whose entity no longer exists (change ids)
    pub orphaned_changes: Vec<String>,
    /// Entity rows whose payload no longer decrypts
    pub quarantined_entities: Vec<(EntityType, String)>,
}

impl IntegrityReport {
    /// Whether the scan found nothing to report
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphaned_changes.is_empty() && self.quarantined_entities.is_empty()
    }
}
