//! Conflict Resolver: turns a detected version mismatch into a single
//! accepted state.
//!
//! Policy is explicit, never implicit. An automatic rule is attempted
//! first; when none applies the conflict is queued for a human. The
//! default policy has no automatic rules at all, so every mismatch goes
//! to an operator unless the product supplies rules.

use std::sync::Arc;

use serde_json::Value;

use crate::api::{ResolveConflictRequest, SyncApi};
use crate::error::{Error, Result};
use crate::models::{Conflict, ConflictId, ResolutionStatus, SyncStatus};
use crate::store::LocalStore;

/// Product-defined automatic resolution rules.
#[derive(Debug, Clone, Default)]
pub struct ResolutionPolicy {
    /// Fields where the device's later edit wins outright. Auto-resolution
    /// fires only when every differing field is in this list.
    lww_fields: Vec<String>,
    /// Merge payloads whose populated fields don't overlap.
    allow_disjoint_merge: bool,
}

impl ResolutionPolicy {
    /// The default: no automatic rule, everything goes to an operator.
    #[must_use]
    pub fn admin_only() -> Self {
        Self::default()
    }

    /// Declare fields eligible for last-write-wins resolution.
    #[must_use]
    pub fn with_lww_fields(mut self, fields: impl IntoIterator<Item = String>) -> Self {
        self.lww_fields = fields.into_iter().collect();
        self
    }

    /// Allow merging payloads with non-overlapping field sets.
    #[must_use]
    pub const fn with_disjoint_merge(mut self) -> Self {
        self.allow_disjoint_merge = true;
        self
    }

    /// Attempt an automatic resolution; None means a human must decide.
    #[must_use]
    pub fn try_auto(&self, local: &Value, server: &Value) -> Option<Value> {
        let (Value::Object(local_map), Value::Object(server_map)) = (local, server) else {
            return None;
        };

        // LWW rule: every differing field must be declared eligible;
        // the device's edit wins those fields, the server keeps the rest.
        let mut differing: Vec<&String> = Vec::new();
        for (key, local_value) in local_map {
            if server_map.get(key) != Some(local_value) {
                differing.push(key);
            }
        }
        for key in server_map.keys() {
            if !local_map.contains_key(key) {
                differing.push(key);
            }
        }

        if !differing.is_empty() && differing.iter().all(|k| self.lww_fields.contains(k)) {
            let mut merged = server_map.clone();
            for key in differing {
                match local_map.get(key) {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
            return Some(Value::Object(merged));
        }

        // Disjoint rule: both sides only added fields the other doesn't
        // have; shared fields must agree exactly.
        if self.allow_disjoint_merge {
            let overlap_disagrees = local_map
                .iter()
                .any(|(k, v)| server_map.get(k).is_some_and(|sv| sv != v));
            if !overlap_disagrees {
                let mut merged = server_map.clone();
                for (key, value) in local_map {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
                return Some(Value::Object(merged));
            }
        }

        None
    }
}

/// Applies resolution policy to recorded conflicts and writes outcomes
/// back through the Local Store.
pub struct ConflictResolver {
    store: Arc<LocalStore>,
    api: Arc<dyn SyncApi>,
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    pub fn new(store: Arc<LocalStore>, api: Arc<dyn SyncApi>, policy: ResolutionPolicy) -> Self {
        Self { store, api, policy }
    }

    /// Classify a freshly detected conflict: auto-resolve it if a rule
    /// applies, otherwise queue it for an operator.
    pub async fn process(&self, id: &ConflictId, now: i64) -> Result<ResolutionStatus> {
        let mut conflict = self
            .store
            .get_conflict(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if conflict.resolution_status == ResolutionStatus::Resolved {
            return Ok(ResolutionStatus::Resolved);
        }

        if let Some(winning) = self
            .policy
            .try_auto(&conflict.local.payload, &conflict.server.payload)
        {
            tracing::info!(conflict = %conflict.id, "conflict auto-resolved");
            conflict.resolution_status = ResolutionStatus::AutoResolved;
            self.store.update_conflict(&conflict)?;
            self.accept(conflict, winning, "auto", now).await?;
            return Ok(ResolutionStatus::Resolved);
        }

        tracing::warn!(conflict = %conflict.id, "conflict requires operator review");
        conflict.resolution_status = ResolutionStatus::AdminRequired;
        self.store.update_conflict(&conflict)?;
        Ok(ResolutionStatus::AdminRequired)
    }

    /// Apply a human decision from the conflict review surface.
    pub async fn resolve_manual(
        &self,
        id: &ConflictId,
        winning_payload: Value,
        resolved_by: &str,
        now: i64,
    ) -> Result<()> {
        let conflict = self
            .store
            .get_conflict(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if conflict.resolution_status == ResolutionStatus::Resolved {
            return Err(Error::Validation(format!(
                "conflict {id} is already resolved"
            )));
        }

        self.accept(conflict, winning_payload, resolved_by, now).await
    }

    /// Accept a winning payload: report it to the server's review surface,
    /// write it back locally, bump the version to the server's, clear the
    /// entity's conflict status, and mark the conflict resolved.
    async fn accept(
        &self,
        mut conflict: Conflict,
        winning_payload: Value,
        resolved_by: &str,
        now: i64,
    ) -> Result<()> {
        self.api
            .resolve_conflict(
                &conflict.id.as_str(),
                &ResolveConflictRequest {
                    winning_payload: winning_payload.clone(),
                    resolved_by: resolved_by.to_string(),
                },
            )
            .await?;

        if let Some(mut entity) = self
            .store
            .get_entity(conflict.entity_type, &conflict.entity_local_id)?
        {
            entity.payload = winning_payload;
            entity.version = conflict.server.version;
            entity.sync_status = SyncStatus::Synced;
            entity.last_modified = now;
            self.store.save_entity(&entity)?;
        }

        // The conflicted (failed) change is superseded by the accepted
        // state; later pending edits stay queued and re-run the protocol.
        for change in self
            .store
            .list_changes_for_entity(conflict.entity_type, &conflict.entity_local_id)?
        {
            if change.status == crate::models::ChangeStatus::Failed {
                self.store.remove_change(&change.id)?;
            }
        }

        conflict.resolution_status = ResolutionStatus::Resolved;
        conflict.resolved_at = Some(now);
        conflict.resolved_by = Some(resolved_by.to_string());
        self.store.update_conflict(&conflict)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_default_policy_never_auto_resolves() {
        let policy = ResolutionPolicy::admin_only();
        assert!(policy
            .try_auto(&json!({"a": 1}), &json!({"a": 2}))
            .is_none());
        assert!(policy
            .try_auto(&json!({"a": 1}), &json!({"b": 2}))
            .is_none());
    }

    #[test]
    fn test_lww_fields_win_for_declared_fields() {
        let policy = ResolutionPolicy::default().with_lww_fields(["notes".to_string()]);
        let merged = policy
            .try_auto(
                &json!({"dose": 2, "notes": "rechecked"}),
                &json!({"dose": 2, "notes": "initial"}),
            )
            .unwrap();
        assert_eq!(merged, json!({"dose": 2, "notes": "rechecked"}));
    }

    #[test]
    fn test_lww_refuses_when_undeclared_field_differs() {
        let policy = ResolutionPolicy::default().with_lww_fields(["notes".to_string()]);
        assert!(policy
            .try_auto(
                &json!({"dose": 3, "notes": "rechecked"}),
                &json!({"dose": 2, "notes": "initial"}),
            )
            .is_none());
    }

    #[test]
    fn test_disjoint_merge_unions_non_overlapping_fields() {
        let policy = ResolutionPolicy::default().with_disjoint_merge();
        let merged = policy
            .try_auto(
                &json!({"site": "A", "localNote": "x"}),
                &json!({"site": "A", "reviewedBy": "dr-s"}),
            )
            .unwrap();
        assert_eq!(
            merged,
            json!({"site": "A", "localNote": "x", "reviewedBy": "dr-s"})
        );
    }

    #[test]
    fn test_disjoint_merge_refuses_overlap_disagreement() {
        let policy = ResolutionPolicy::default().with_disjoint_merge();
        assert!(policy
            .try_auto(&json!({"site": "A"}), &json!({"site": "B"}))
            .is_none());
    }

    #[test]
    fn test_non_object_payloads_go_to_admin() {
        let policy = ResolutionPolicy::default()
            .with_lww_fields(["x".to_string()])
            .with_disjoint_merge();
        assert!(policy.try_auto(&json!(1), &json!(2)).is_none());
    }
}
