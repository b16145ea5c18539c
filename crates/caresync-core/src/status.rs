//! Aggregate sync state surfaced to callers.
//!
//! The UI never sees individual sync failures; it observes this summary.

use serde::Serialize;

/// Banner-level sync state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BannerState {
    Offline,
    Syncing,
    Synced,
    SyncError,
}

/// Everything the operator surface shows about sync health.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub banner: BannerState,
    /// Operations not yet acknowledged by the server
    pub pending_operations: u64,
    /// Unresolved conflicts
    pub open_conflicts: u64,
    /// Changes frozen for operator intervention
    pub intervention_required: u64,
    /// Last fully completed cycle (Unix ms), None before the first
    pub last_synced_at: Option<i64>,
    /// Most recent cycle-level error, cleared by a clean cycle
    pub last_error: Option<String>,
}

impl SyncSummary {
    /// Human-readable one-liner for the non-blocking banner.
    #[must_use]
    pub fn banner_text(&self) -> String {
        match self.banner {
            BannerState::Offline => "offline".to_string(),
            BannerState::Syncing => "syncing".to_string(),
            BannerState::Synced => "synced".to_string(),
            BannerState::SyncError => {
                format!("sync error — {} operations pending", self.pending_operations)
            }
        }
    }
}
