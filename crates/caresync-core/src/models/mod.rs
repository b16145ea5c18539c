//! Data models for CareSync

mod conflict;
mod entity;
mod pending_change;

pub use conflict::{Conflict, ConflictId, ResolutionStatus, VersionSnapshot};
pub use entity::{EntityLocalId, EntityType, LocalEntity, SyncStatus};
pub use pending_change::{ChangeId, ChangeStatus, OperationType, PendingChange};

/// Current time in Unix milliseconds from the device wall clock.
///
/// Sync-relevant timestamps should come from the Clock Service's adjusted
/// time instead; this is the raw reading it corrects.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
