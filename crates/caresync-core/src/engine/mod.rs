//! Sync Engine: drives reconciliation between the Local Store and the
//! server.
//!
//! One cycle pushes queued changes FIFO, hands version mismatches to the
//! Conflict Resolver, pulls server updates since the persisted watermark,
//! and updates the aggregate summary. Re-entrant triggers while a cycle
//! runs are coalesced into a single follow-up cycle.

mod backoff;

pub use backoff::BackoffConfig;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{PushOperation, PushRequest, PushResult, PushStatus, SyncApi};
use crate::clock::ClockService;
use crate::error::{Error, Result};
use crate::models::{
    ChangeStatus, Conflict, EntityType, LocalEntity, PendingChange, SyncStatus, VersionSnapshot,
};
use crate::network::{NetworkMonitor, Subscription};
use crate::resolver::ConflictResolver;
use crate::status::{BannerState, SyncSummary};
use crate::store::LocalStore;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backoff: BackoffConfig,
    /// Retention for entities created by pull or bundle download (ms)
    pub default_ttl_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            default_ttl_ms: 30 * 24 * 60 * 60 * 1_000,
        }
    }
}

/// Counters from one completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub pushed: usize,
    pub conflicts: usize,
    pub retried: usize,
    pub frozen: usize,
    pub pulled: usize,
    pub purged: usize,
}

/// How a sync trigger ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A cycle was already running; this trigger folded into a re-run
    Coalesced,
    /// No connectivity, nothing attempted
    Offline,
    /// Sync is paused until re-authentication
    AuthPaused,
    /// Server-mandated cool-down is still in effect
    RateLimited,
    /// A cycle ran to its end (possibly with per-change failures)
    Completed(CycleStats),
}

/// Orchestrates push/pull cycles. Constructed once per device and shared
/// behind an `Arc`.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    api: Arc<dyn SyncApi>,
    clock: Arc<ClockService>,
    network: NetworkMonitor,
    resolver: Arc<ConflictResolver>,
    config: EngineConfig,
    running: AtomicBool,
    run_again: AtomicBool,
    auth_paused: AtomicBool,
    /// Adjusted-time instant before which no push may be attempted
    rate_limited_until: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        api: Arc<dyn SyncApi>,
        clock: Arc<ClockService>,
        network: NetworkMonitor,
        resolver: Arc<ConflictResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            network,
            resolver,
            config,
            running: AtomicBool::new(false),
            run_again: AtomicBool::new(false),
            auth_paused: AtomicBool::new(false),
            rate_limited_until: AtomicI64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Trigger a sync cycle. Safe to call from the network-online
    /// callback, a periodic timer, and an explicit user action at once:
    /// overlapping triggers coalesce into a single follow-up run.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.run_again.store(true, Ordering::SeqCst);
            // The active cycle may have started winding down before the
            // flag landed; claim the slot ourselves if it was just
            // released, otherwise the request would never run.
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(CycleOutcome::Coalesced);
            }
        }

        let mut outcome;
        loop {
            // Triggers flagged before this point are served by the cycle
            // about to start.
            self.run_again.store(false, Ordering::SeqCst);
            outcome = self.run_cycle().await;
            while self.run_again.swap(false, Ordering::SeqCst) {
                outcome = self.run_cycle().await;
            }
            self.running.store(false, Ordering::SeqCst);
            // Same race on exit: a trigger can coalesce between the drain
            // and the release. Re-check and reclaim rather than strand it.
            if !self.run_again.load(Ordering::SeqCst)
                || self.running.swap(true, Ordering::SeqCst)
            {
                break;
            }
        }
        outcome
    }

    /// Resume after re-authentication and trigger a cycle.
    pub async fn resume_after_auth(&self) -> Result<CycleOutcome> {
        self.auth_paused.store(false, Ordering::SeqCst);
        self.sync_now().await
    }

    /// Whether sync is paused awaiting re-authentication.
    pub fn is_auth_paused(&self) -> bool {
        self.auth_paused.load(Ordering::SeqCst)
    }

    /// Seed the Local Store from a full server snapshot.
    pub async fn download_bundle(&self) -> Result<usize> {
        let device_id = self.store.device_id()?;
        let bundle = self.api.download_bundle(&device_id).await?;
        let now = self.clock.adjusted_time();

        let mut seeded = 0;
        for update in bundle.entities {
            let Ok(entity_type) = update.entity_type.parse::<EntityType>() else {
                tracing::warn!("bundle entry with unknown entity type {}", update.entity_type);
                continue;
            };
            // A re-download must not duplicate records already on device
            if self
                .store
                .get_entity_by_server_id(entity_type, &update.server_id)?
                .is_some()
            {
                continue;
            }
            let entity = LocalEntity::from_download(
                entity_type,
                update.server_id,
                update.version,
                update.payload,
                &device_id,
                now,
                self.config.default_ttl_ms,
            );
            self.store.save_entity(&entity)?;
            seeded += 1;
        }

        self.store.set_pull_watermark(now)?;
        tracing::info!("bundle download seeded {seeded} entities");
        Ok(seeded)
    }

    /// Aggregate state for the operator surface; the only sync state the
    /// UI layer observes.
    pub fn summary(&self) -> Result<SyncSummary> {
        let pending = self.store.count_pending()?;
        let conflicts = self.store.list_conflicts()?.len() as u64;
        let intervention = self.store.list_intervention_required()?.len() as u64;
        let last_error = self.last_error().clone();

        let banner = if !self.network.check_network() {
            BannerState::Offline
        } else if self.running.load(Ordering::SeqCst) {
            BannerState::Syncing
        } else if last_error.is_some() || intervention > 0 {
            BannerState::SyncError
        } else {
            BannerState::Synced
        };

        Ok(SyncSummary {
            banner,
            pending_operations: pending,
            open_conflicts: conflicts,
            intervention_required: intervention,
            last_synced_at: self.store.last_synced_at()?,
            last_error,
        })
    }

    /// Wire the engine to connectivity transitions: coming online spawns a
    /// cycle. Keep the returned subscription alive as long as auto-sync
    /// should run.
    #[must_use]
    pub fn attach_network_trigger(self: &Arc<Self>) -> Subscription {
        let engine = Arc::clone(self);
        self.network.subscribe(move |online| {
            if online {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if let Err(e) = engine.sync_now().await {
                        tracing::error!("auto sync after reconnect failed: {e}");
                    }
                });
            }
        })
    }

    /// Spawn a periodic sync trigger.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sync_now().await {
                    tracing::error!("periodic sync failed: {e}");
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Cycle internals
    // ------------------------------------------------------------------

    async fn run_cycle(&self) -> Result<CycleOutcome> {
        if self.auth_paused.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::AuthPaused);
        }
        if !self.network.check_network() {
            return Ok(CycleOutcome::Offline);
        }

        // Refresh the clock offset first so every timestamp this cycle
        // produces is adjusted; failure degrades but never blocks.
        if self.clock.needs_sync() {
            let _ = self.clock.sync(self.api.as_ref()).await;
        }

        if self.clock.adjusted_time() < self.rate_limited_until.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::RateLimited);
        }

        let device_id = self.store.device_id()?;
        // Rows left `syncing` by a crash or a mid-push storage failure
        // would otherwise never be selected again.
        self.store.recover_inflight_changes()?;
        let mut stats = CycleStats::default();
        let mut cycle_error: Option<String> = None;

        self.push_changes(&device_id, &mut stats, &mut cycle_error)
            .await?;

        if self.auth_paused.load(Ordering::SeqCst) {
            *self.last_error() = cycle_error;
            return Ok(CycleOutcome::AuthPaused);
        }

        // Pull only while still online; a failed pull is a cycle error
        // but never rolls back pushed acknowledgments.
        if self.network.check_network() {
            if let Err(e) = self.pull_updates(&device_id, &mut stats).await {
                tracing::warn!("pull failed: {e}");
                cycle_error.get_or_insert_with(|| e.to_string());
            }
        }

        let now = self.clock.adjusted_time();
        if cycle_error.is_none() {
            self.store.set_last_synced_at(now)?;
            stats.purged = self.store.cleanup_expired(now)?;
        }
        *self.last_error() = cycle_error;

        tracing::debug!(?stats, "sync cycle finished");
        Ok(CycleOutcome::Completed(stats))
    }

    async fn push_changes(
        &self,
        device_id: &str,
        stats: &mut CycleStats,
        cycle_error: &mut Option<String>,
    ) -> Result<()> {
        // Entities already blocked this cycle by a fresh conflict
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        for change in self.store.list_pending()? {
            // Going offline mid-cycle abandons the rest; everything
            // acknowledged so far is already committed.
            if !self.network.check_network() {
                tracing::warn!("offline mid-cycle, abandoning remaining pushes");
                break;
            }

            let now = self.clock.adjusted_time();
            if now < self.rate_limited_until.load(Ordering::SeqCst) {
                break;
            }

            let key = (change.entity_type, change.entity_local_id.as_str());
            if blocked.contains(&key) {
                continue;
            }
            // Conflicted entities wait for resolution before further pushes
            if !self
                .store
                .list_conflicts_for_entity(change.entity_type, &change.entity_local_id)?
                .is_empty()
            {
                blocked.insert(key);
                continue;
            }
            if !Self::is_eligible(&change, now) {
                continue;
            }

            // Re-read the row: an acknowledgment earlier in this cycle may
            // have rebased this change's base version.
            let Some(mut change) = self.store.get_change(&change.id)? else {
                continue;
            };
            if change.status != ChangeStatus::Pending {
                continue;
            }
            change.status = ChangeStatus::Syncing;
            change.last_attempt_at = Some(now);
            self.store.update_change(&change)?;

            let request = PushRequest {
                device_id: device_id.to_string(),
                operations: vec![wire_operation(&change)],
            };

            match self.api.push(&request).await {
                Ok(response) => {
                    let result = response
                        .results
                        .into_iter()
                        .find(|r| r.entity_local_id == change.entity_local_id.as_str());
                    match result {
                        Some(result) if result.status == PushStatus::Applied => {
                            self.apply_acknowledgment(&change, &result)?;
                            stats.pushed += 1;
                        }
                        Some(result) => {
                            self.record_conflict(&change, &result, now).await?;
                            stats.conflicts += 1;
                            blocked.insert((change.entity_type, change.entity_local_id.as_str()));
                        }
                        None => {
                            let err = Error::Network(
                                "push response missing result for operation".to_string(),
                            );
                            self.handle_push_failure(&mut change, &err, now, stats)?;
                            cycle_error.get_or_insert_with(|| err.to_string());
                        }
                    }
                }
                Err(err) => {
                    if matches!(err, Error::Storage(_) | Error::Encryption(_)) {
                        return Err(err);
                    }
                    self.handle_push_failure(&mut change, &err, now, stats)?;
                    cycle_error.get_or_insert_with(|| err.to_string());
                    if matches!(err, Error::Auth(_)) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether the change's backoff deadline has passed.
    fn is_eligible(change: &PendingChange, now: i64) -> bool {
        change.next_attempt_at.map_or(true, |at| now >= at)
    }

    /// Jittered delay before the change's next attempt (ms).
    #[allow(clippy::cast_possible_wrap)]
    fn retry_delay_ms(&self, retry_count: u32) -> i64 {
        self.config
            .backoff
            .next_delay_jittered_ms(retry_count, &mut rand::thread_rng()) as i64
    }

    /// Server accepted the operation: commit its acknowledgment locally.
    fn apply_acknowledgment(&self, change: &PendingChange, result: &PushResult) -> Result<()> {
        self.store.remove_change(&change.id)?;

        if change.operation_type == crate::models::OperationType::Delete {
            self.store
                .delete_entity(change.entity_type, &change.entity_local_id)?;
            return Ok(());
        }

        // Later edits queued for this entity were observed on top of this
        // one; replay them against the version the server just assigned.
        if let Some(version) = result.version {
            self.store.rebase_changes_for_entity(
                change.entity_type,
                &change.entity_local_id,
                version,
            )?;
        }

        if let Some(mut entity) = self
            .store
            .get_entity(change.entity_type, &change.entity_local_id)?
        {
            if let Some(server_id) = &result.server_id {
                entity.server_id = Some(server_id.clone());
            }
            if let Some(version) = result.version {
                entity.version = version;
            }
            // Later queued edits keep the entity pending until they land
            let still_queued = self
                .store
                .has_changes_for_entity(change.entity_type, &change.entity_local_id)?;
            entity.sync_status = if still_queued {
                SyncStatus::Pending
            } else {
                SyncStatus::Synced
            };
            self.store.save_entity(&entity)?;
        }
        Ok(())
    }

    /// Server rejected the operation with a version mismatch: record the
    /// conflict and hand it straight to the resolver.
    async fn record_conflict(
        &self,
        change: &PendingChange,
        result: &PushResult,
        now: i64,
    ) -> Result<()> {
        let conflict = Conflict::new(
            change.entity_type,
            change.entity_local_id,
            VersionSnapshot {
                version: change.base_version,
                payload: change.payload.clone(),
            },
            VersionSnapshot {
                version: result.version.unwrap_or(0),
                payload: result
                    .server_payload
                    .clone()
                    .unwrap_or(serde_json::Value::Null),
            },
            now,
        );
        tracing::warn!(
            entity = %change.entity_local_id,
            base_version = change.base_version,
            server_version = conflict.server.version,
            "version conflict detected"
        );
        self.store.add_conflict(&conflict)?;

        if let Some(mut entity) = self
            .store
            .get_entity(change.entity_type, &change.entity_local_id)?
        {
            entity.sync_status = SyncStatus::Conflict;
            self.store.save_entity(&entity)?;
        }

        let mut failed = change.clone();
        failed.status = ChangeStatus::Failed;
        failed.error_message = Some(format!(
            "version conflict: base {} vs server {}",
            change.base_version, conflict.server.version
        ));
        self.store.update_change(&failed)?;

        // The resolver applies an automatic rule or queues the conflict
        // for an operator; either way it is never silently dropped.
        self.resolver.process(&conflict.id, now).await?;
        Ok(())
    }

    /// Transport-level failure: book retry state on the change row.
    fn handle_push_failure(
        &self,
        change: &mut PendingChange,
        err: &Error,
        now: i64,
        stats: &mut CycleStats,
    ) -> Result<()> {
        match err {
            Error::Auth(message) => {
                // Does not consume retry budget; everything pauses
                change.status = ChangeStatus::Pending;
                change.error_message = Some(message.clone());
                self.store.update_change(change)?;
                self.auth_paused.store(true, Ordering::SeqCst);
                tracing::warn!("sync paused until re-authentication: {message}");
            }
            Error::RateLimited { retry_after_ms } => {
                change.retry_count += 1;
                let computed = self.retry_delay_ms(change.retry_count);
                let delay = computed.max(*retry_after_ms);
                self.rate_limited_until
                    .store(now + delay, Ordering::SeqCst);
                change.status = ChangeStatus::Pending;
                change.next_attempt_at = Some(now + delay);
                change.error_message = Some(err.to_string());
                self.store.update_change(change)?;
                stats.retried += 1;
            }
            Error::Validation(message) => {
                // Non-retryable: freeze immediately for an operator
                change.status = ChangeStatus::RequiresIntervention;
                change.error_message = Some(message.clone());
                self.store.update_change(change)?;
                stats.frozen += 1;
            }
            _ => {
                change.retry_count += 1;
                change.error_message = Some(err.to_string());
                change.next_attempt_at = Some(now + self.retry_delay_ms(change.retry_count));
                if self.config.backoff.exhausted(change.retry_count) {
                    change.status = ChangeStatus::RequiresIntervention;
                    stats.frozen += 1;
                    tracing::error!(
                        change = %change.id,
                        retries = change.retry_count,
                        "retry budget exhausted, freezing change for intervention"
                    );
                } else {
                    change.status = ChangeStatus::Pending;
                    stats.retried += 1;
                }
                self.store.update_change(change)?;
            }
        }
        Ok(())
    }

    /// Apply server-side updates since the persisted watermark to entities
    /// with no conflicting local pending change.
    async fn pull_updates(&self, device_id: &str, stats: &mut CycleStats) -> Result<()> {
        let since = self.store.pull_watermark()?;
        let pull_started = self.clock.adjusted_time();
        let response = self.api.pull(device_id, since).await?;

        for update in response.updates {
            let Ok(entity_type) = update.entity_type.parse::<EntityType>() else {
                tracing::warn!("pull update with unknown entity type {}", update.entity_type);
                continue;
            };

            match self
                .store
                .get_entity_by_server_id(entity_type, &update.server_id)?
            {
                Some(mut entity) => {
                    // Local pending edits win until they are pushed (and
                    // then the server's version check arbitrates).
                    if entity.sync_status != SyncStatus::Synced
                        || self
                            .store
                            .has_changes_for_entity(entity_type, &entity.local_id)?
                    {
                        continue;
                    }
                    if update.version <= entity.version {
                        continue;
                    }
                    entity.version = update.version;
                    entity.payload = update.payload;
                    entity.last_modified = pull_started;
                    self.store.save_entity(&entity)?;
                    stats.pulled += 1;
                }
                None => {
                    let entity = LocalEntity::from_download(
                        entity_type,
                        update.server_id,
                        update.version,
                        update.payload,
                        device_id,
                        pull_started,
                        self.config.default_ttl_ms,
                    );
                    self.store.save_entity(&entity)?;
                    stats.pulled += 1;
                }
            }
        }

        self.store.set_pull_watermark(pull_started)?;
        Ok(())
    }

    fn last_error(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn wire_operation(change: &PendingChange) -> PushOperation {
    PushOperation {
        entity_type: change.entity_type.as_str().to_string(),
        entity_local_id: change.entity_local_id.as_str(),
        operation_type: change.operation_type.as_str().to_string(),
        payload: change.payload.clone(),
        base_version: change.base_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        BundleResponse, PullResponse, PushResponse, ResolveConflictRequest, ServerConflict,
        ServerSyncStatus, ServerUpdate, TimeResponse,
    };
    use crate::clock::{ClockConfig, ClockService};
    use crate::crypto::KEY_SIZE;
    use crate::models::{now_millis, OperationType, ResolutionStatus};
    use crate::resolver::ResolutionPolicy;
    use crate::store::StorePath;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicU64};

    #[derive(Clone)]
    struct ServerRecord {
        entity_type: String,
        server_id: String,
        version: i64,
        payload: serde_json::Value,
    }

    /// In-memory server with real optimistic-concurrency checks: an
    /// operation applies only when its base version matches the record's
    /// current version, otherwise the server side of the conflict comes
    /// back in the result.
    #[derive(Default)]
    struct FakeServer {
        records: Mutex<HashMap<String, ServerRecord>>,
        next_id: AtomicU64,
        fail_pushes: AtomicU32,
        auth_failing: AtomicBool,
        rate_limit_next: Mutex<Option<i64>>,
        pull_feed: Mutex<Vec<ServerUpdate>>,
        resolved: Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn seed_record(
            &self,
            local_id: &str,
            entity_type: &str,
            server_id: &str,
            version: i64,
            payload: serde_json::Value,
        ) {
            self.records.lock().unwrap().insert(
                local_id.to_string(),
                ServerRecord {
                    entity_type: entity_type.to_string(),
                    server_id: server_id.to_string(),
                    version,
                    payload,
                },
            );
        }

        fn record(&self, local_id: &str) -> Option<ServerRecord> {
            self.records.lock().unwrap().get(local_id).cloned()
        }
    }

    #[async_trait]
    impl SyncApi for FakeServer {
        async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
            if self.auth_failing.load(Ordering::SeqCst) {
                return Err(Error::Auth("token expired".into()));
            }
            if let Some(retry_after_ms) = self.rate_limit_next.lock().unwrap().take() {
                return Err(Error::RateLimited { retry_after_ms });
            }
            if self.fail_pushes.load(Ordering::SeqCst) > 0 {
                self.fail_pushes.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Network("connection reset".into()));
            }

            let mut records = self.records.lock().unwrap();
            let mut results = Vec::new();
            for op in &request.operations {
                let current = records.get(&op.entity_local_id).cloned();
                let current_version = current.as_ref().map_or(0, |r| r.version);
                // The server recognizes the device-generated id: a
                // replayed create acks the existing record untouched.
                if op.operation_type == "create" {
                    if let Some(record) = current.clone() {
                        results.push(PushResult {
                            entity_local_id: op.entity_local_id.clone(),
                            status: PushStatus::Applied,
                            server_id: Some(record.server_id),
                            version: Some(record.version),
                            server_payload: None,
                        });
                        continue;
                    }
                }
                if op.base_version == current_version {
                    if op.operation_type == "delete" {
                        records.remove(&op.entity_local_id);
                        results.push(PushResult {
                            entity_local_id: op.entity_local_id.clone(),
                            status: PushStatus::Applied,
                            server_id: None,
                            version: None,
                            server_payload: None,
                        });
                    } else {
                        let server_id = current.map_or_else(
                            || format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
                            |r| r.server_id,
                        );
                        let version = current_version + 1;
                        records.insert(
                            op.entity_local_id.clone(),
                            ServerRecord {
                                entity_type: op.entity_type.clone(),
                                server_id: server_id.clone(),
                                version,
                                payload: op.payload.clone(),
                            },
                        );
                        results.push(PushResult {
                            entity_local_id: op.entity_local_id.clone(),
                            status: PushStatus::Applied,
                            server_id: Some(server_id),
                            version: Some(version),
                            server_payload: None,
                        });
                    }
                } else {
                    let record = current.expect("conflict without a server record");
                    results.push(PushResult {
                        entity_local_id: op.entity_local_id.clone(),
                        status: PushStatus::Conflict,
                        server_id: Some(record.server_id),
                        version: Some(record.version),
                        server_payload: Some(record.payload),
                    });
                }
            }
            Ok(PushResponse { results })
        }

        async fn pull(&self, _device_id: &str, _since: i64) -> Result<PullResponse> {
            let updates = self.pull_feed.lock().unwrap().drain(..).collect();
            Ok(PullResponse { updates })
        }

        async fn status(&self, device_id: &str) -> Result<ServerSyncStatus> {
            Ok(ServerSyncStatus {
                device_id: device_id.to_string(),
                outstanding_operations: 0,
                open_conflicts: 0,
            })
        }

        async fn download_bundle(&self, _device_id: &str) -> Result<BundleResponse> {
            let entities = self
                .records
                .lock()
                .unwrap()
                .values()
                .map(|r| ServerUpdate {
                    entity_type: r.entity_type.clone(),
                    server_id: r.server_id.clone(),
                    version: r.version,
                    payload: r.payload.clone(),
                })
                .collect();
            Ok(BundleResponse { entities })
        }

        async fn list_conflicts(&self) -> Result<Vec<ServerConflict>> {
            Ok(Vec::new())
        }

        async fn resolve_conflict(&self, id: &str, _r: &ResolveConflictRequest) -> Result<()> {
            self.resolved.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn server_time(&self) -> Result<TimeResponse> {
            let now = now_millis();
            Ok(TimeResponse {
                timestamp: now,
                server_time: now,
            })
        }
    }

    fn harness(
        server: Arc<FakeServer>,
    ) -> (
        Arc<SyncEngine>,
        Arc<LocalStore>,
        NetworkMonitor,
        Arc<ConflictResolver>,
    ) {
        // Zero delays so retries are immediately eligible
        harness_with_backoff(
            server,
            BackoffConfig {
                base_ms: 0,
                cap_ms: 0,
                jitter_ratio: 0.0,
                intervention_threshold: 3,
            },
        )
    }

    fn harness_with_backoff(
        server: Arc<FakeServer>,
        backoff: BackoffConfig,
    ) -> (
        Arc<SyncEngine>,
        Arc<LocalStore>,
        NetworkMonitor,
        Arc<ConflictResolver>,
    ) {
        let store = Arc::new(LocalStore::new());
        store
            .initialize(&StorePath::InMemory, &[7u8; KEY_SIZE])
            .unwrap();
        let api: Arc<dyn SyncApi> = server;
        let clock = Arc::new(ClockService::new(ClockConfig::default()));
        let network = NetworkMonitor::new();
        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&store),
            Arc::clone(&api),
            ResolutionPolicy::admin_only(),
        ));
        let config = EngineConfig {
            backoff,
            default_ttl_ms: 60 * 60 * 1_000,
        };
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            api,
            clock,
            network.clone(),
            Arc::clone(&resolver),
            config,
        ));
        (engine, store, network, resolver)
    }

    fn capture_entity(store: &LocalStore, payload: serde_json::Value, at: i64) -> LocalEntity {
        let entity = LocalEntity::new_local(
            EntityType::Treatment,
            payload.clone(),
            "device-1",
            at,
            3_600_000,
        );
        store.save_entity(&entity).unwrap();
        let change = PendingChange::new(
            OperationType::Create,
            EntityType::Treatment,
            entity.local_id,
            payload,
            0,
            at,
        );
        store.enqueue_change(&change).unwrap();
        entity
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_capture_syncs_on_reconnect() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let entity = capture_entity(&store, json!({"site": "A"}), now_millis());

        assert_eq!(engine.sync_now().await.unwrap(), CycleOutcome::Offline);
        assert_eq!(store.count_pending().unwrap(), 1);

        network.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.pushed == 1));

        let synced = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert_eq!(synced.version, 1);
        assert!(synced.server_id.is_some());
        assert_eq!(store.count_pending().unwrap(), 0);

        let summary = engine.summary().unwrap();
        assert_eq!(summary.banner, BannerState::Synced);
        assert!(summary.last_synced_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sequential_edits_replay_in_order() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let at = now_millis();
        let entity = capture_entity(&store, json!({"site": "A"}), at);
        let update = PendingChange::new(
            OperationType::Update,
            EntityType::Treatment,
            entity.local_id,
            json!({"site": "B"}),
            0,
            at + 10,
        );
        store.enqueue_change(&update).unwrap();

        network.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.pushed == 2 && s.conflicts == 0));

        let record = server.record(&entity.local_id.as_str()).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload, json!({"site": "B"}));
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replayed_create_is_idempotent() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let at = now_millis();
        let entity = capture_entity(&store, json!({"site": "A"}), at);
        network.set_online(true);
        engine.sync_now().await.unwrap();

        // Ack lost before the queue row was removed: the same create
        // replays on the next cycle
        store
            .enqueue_change(&PendingChange::new(
                OperationType::Create,
                EntityType::Treatment,
                entity.local_id,
                json!({"site": "A"}),
                0,
                at + 5,
            ))
            .unwrap();
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.pushed == 1 && s.conflicts == 0));

        let record = server.record(&entity.local_id.as_str()).unwrap();
        assert_eq!(record.version, 1);
        let entity = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(entity.version, 1);
        assert_eq!(entity.sync_status, SyncStatus::Synced);
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_base_version_records_conflict_for_admin() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let at = now_millis();

        // Locally observed version 1; the server has since moved to 2
        let mut entity = LocalEntity::new_local(
            EntityType::Treatment,
            json!({"site": "A"}),
            "device-1",
            at,
            3_600_000,
        );
        entity.server_id = Some("srv-1".to_string());
        entity.version = 1;
        entity.sync_status = SyncStatus::Pending;
        store.save_entity(&entity).unwrap();
        server.seed_record(
            &entity.local_id.as_str(),
            "treatment",
            "srv-1",
            2,
            json!({"site": "Z"}),
        );
        let change = PendingChange::new(
            OperationType::Update,
            EntityType::Treatment,
            entity.local_id,
            json!({"site": "B"}),
            1,
            at,
        );
        store.enqueue_change(&change).unwrap();

        network.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.conflicts == 1));

        let conflicts = store.list_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.resolution_status, ResolutionStatus::AdminRequired);
        assert_eq!(conflict.local.version, 1);
        assert_eq!(conflict.local.payload, json!({"site": "B"}));
        assert_eq!(conflict.server.version, 2);
        assert_eq!(conflict.server.payload, json!({"site": "Z"}));

        let entity = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Conflict);

        // The rejected change is blocked, not retried
        assert!(store.list_pending().unwrap().is_empty());
        let held = store
            .list_changes_for_entity(EntityType::Treatment, &entity.local_id)
            .unwrap();
        assert_eq!(held[0].status, ChangeStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_manual_resolution_unblocks_entity() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, resolver) = harness(Arc::clone(&server));
        let at = now_millis();
        let mut entity = LocalEntity::new_local(
            EntityType::Treatment,
            json!({"site": "A"}),
            "device-1",
            at,
            3_600_000,
        );
        entity.server_id = Some("srv-1".to_string());
        entity.version = 1;
        store.save_entity(&entity).unwrap();
        server.seed_record(
            &entity.local_id.as_str(),
            "treatment",
            "srv-1",
            2,
            json!({"site": "Z"}),
        );
        store
            .enqueue_change(&PendingChange::new(
                OperationType::Update,
                EntityType::Treatment,
                entity.local_id,
                json!({"site": "B"}),
                1,
                at,
            ))
            .unwrap();

        network.set_online(true);
        engine.sync_now().await.unwrap();
        let conflict = store.list_conflicts().unwrap().remove(0);

        resolver
            .resolve_manual(&conflict.id, json!({"site": "M"}), "admin-7", at + 100)
            .await
            .unwrap();

        let entity = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Synced);
        assert_eq!(entity.version, 2);
        assert_eq!(entity.payload, json!({"site": "M"}));
        assert_eq!(store.count_pending().unwrap(), 0);
        assert!(store.list_conflicts().unwrap().is_empty());
        assert_eq!(server.resolved.lock().unwrap().as_slice(), &[conflict.id.as_str()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_failures_retry_then_freeze() {
        let server = Arc::new(FakeServer::default());
        server.fail_pushes.store(10, Ordering::SeqCst);
        let (engine, store, network, _) = harness(Arc::clone(&server));
        capture_entity(&store, json!({"site": "A"}), now_millis());
        network.set_online(true);

        for _ in 0..2 {
            let outcome = engine.sync_now().await.unwrap();
            assert!(matches!(outcome, CycleOutcome::Completed(s) if s.retried == 1));
        }
        // Third consecutive failure reaches the intervention threshold
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.frozen == 1));

        assert!(store.list_pending().unwrap().is_empty());
        let frozen = store.list_intervention_required().unwrap();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].retry_count, 3);
        assert!(frozen[0].error_message.is_some());

        let summary = engine.summary().unwrap();
        assert_eq!(summary.banner, BannerState::SyncError);
        assert_eq!(summary.intervention_required, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backoff_defers_retry_until_deadline() {
        let server = Arc::new(FakeServer::default());
        server.fail_pushes.store(1, Ordering::SeqCst);
        let (engine, store, network, _) = harness_with_backoff(
            Arc::clone(&server),
            BackoffConfig {
                base_ms: 60_000,
                cap_ms: 600_000,
                jitter_ratio: 0.2,
                intervention_threshold: 10,
            },
        );
        capture_entity(&store, json!({"site": "A"}), now_millis());
        network.set_online(true);

        let before = now_millis();
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.retried == 1));
        let after = now_millis();

        // First retry waits base * 2 = 120s, randomized by +/- 20%
        let pending = store.list_pending().unwrap();
        let deadline = pending[0].next_attempt_at.unwrap();
        assert!(deadline >= before + 96_000, "deadline {deadline} too early");
        assert!(deadline <= after + 144_000, "deadline {deadline} too late");

        // The deadline is in the future, so the next cycle skips the change
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Completed(s) if s.pushed == 0 && s.retried == 0
        ));
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inflight_change_recovers_after_restart() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let entity = capture_entity(&store, json!({"site": "A"}), now_millis());

        // A crash mid-push leaves the row marked syncing; it no longer
        // shows up in the pending queue even though it was never pushed
        let mut change = store.list_pending().unwrap().remove(0);
        change.status = ChangeStatus::Syncing;
        store.update_change(&change).unwrap();
        assert!(store.list_pending().unwrap().is_empty());
        assert_eq!(store.count_pending().unwrap(), 1);

        network.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.pushed == 1));
        assert_eq!(store.count_pending().unwrap(), 0);

        let entity = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_failure_pauses_without_consuming_retries() {
        let server = Arc::new(FakeServer::default());
        server.auth_failing.store(true, Ordering::SeqCst);
        let (engine, store, network, _) = harness(Arc::clone(&server));
        capture_entity(&store, json!({"site": "A"}), now_millis());
        network.set_online(true);

        assert_eq!(engine.sync_now().await.unwrap(), CycleOutcome::AuthPaused);
        assert!(engine.is_auth_paused());
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);

        // Still paused: nothing is attempted
        assert_eq!(engine.sync_now().await.unwrap(), CycleOutcome::AuthPaused);

        server.auth_failing.store(false, Ordering::SeqCst);
        let outcome = engine.resume_after_auth().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.pushed == 1));
        assert!(!engine.is_auth_paused());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rate_limit_defers_following_cycles() {
        let server = Arc::new(FakeServer::default());
        *server.rate_limit_next.lock().unwrap() = Some(60_000);
        let (engine, store, network, _) = harness(Arc::clone(&server));
        capture_entity(&store, json!({"site": "A"}), now_millis());
        network.set_online(true);

        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.retried == 1));
        let pending = store.list_pending().unwrap();
        assert_eq!(pending[0].retry_count, 1);

        // The server-mandated cool-down holds even though backoff is zero
        assert_eq!(engine.sync_now().await.unwrap(), CycleOutcome::RateLimited);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_applies_only_to_clean_entities() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        network.set_online(true);
        let device_id = store.device_id().unwrap();
        let at = now_millis();

        let clean = LocalEntity::from_download(
            EntityType::Treatment,
            "srv-a",
            1,
            json!({"site": "A"}),
            &device_id,
            at,
            3_600_000,
        );
        store.save_entity(&clean).unwrap();
        let newer = LocalEntity::from_download(
            EntityType::Treatment,
            "srv-b",
            5,
            json!({"site": "B"}),
            &device_id,
            at,
            3_600_000,
        );
        store.save_entity(&newer).unwrap();
        let mut edited = LocalEntity::from_download(
            EntityType::Treatment,
            "srv-c",
            1,
            json!({"site": "C"}),
            &device_id,
            at,
            3_600_000,
        );
        edited.sync_status = SyncStatus::Pending;
        store.save_entity(&edited).unwrap();
        store
            .enqueue_change(&PendingChange::new(
                OperationType::Update,
                EntityType::Treatment,
                edited.local_id,
                json!({"site": "C2"}),
                1,
                at,
            ))
            .unwrap();

        *server.pull_feed.lock().unwrap() = vec![
            ServerUpdate {
                entity_type: "treatment".into(),
                server_id: "srv-a".into(),
                version: 2,
                payload: json!({"site": "A2"}),
            },
            ServerUpdate {
                entity_type: "treatment".into(),
                server_id: "srv-b".into(),
                version: 4,
                payload: json!({"site": "stale"}),
            },
            ServerUpdate {
                entity_type: "treatment".into(),
                server_id: "srv-c".into(),
                version: 9,
                payload: json!({"site": "foreign"}),
            },
            ServerUpdate {
                entity_type: "treatment".into(),
                server_id: "srv-new".into(),
                version: 1,
                payload: json!({"site": "N"}),
            },
        ];

        let mut stats = CycleStats::default();
        engine.pull_updates(&device_id, &mut stats).await.unwrap();
        assert_eq!(stats.pulled, 2);

        let clean = store
            .get_entity_by_server_id(EntityType::Treatment, "srv-a")
            .unwrap()
            .unwrap();
        assert_eq!(clean.version, 2);
        assert_eq!(clean.payload, json!({"site": "A2"}));

        let newer = store
            .get_entity_by_server_id(EntityType::Treatment, "srv-b")
            .unwrap()
            .unwrap();
        assert_eq!(newer.version, 5);
        assert_eq!(newer.payload, json!({"site": "B"}));

        // Local pending edit wins until it is pushed
        let edited = store
            .get_entity_by_server_id(EntityType::Treatment, "srv-c")
            .unwrap()
            .unwrap();
        assert_eq!(edited.version, 1);
        assert_eq!(edited.payload, json!({"site": "C"}));

        let added = store
            .get_entity_by_server_id(EntityType::Treatment, "srv-new")
            .unwrap()
            .unwrap();
        assert_eq!(added.sync_status, SyncStatus::Synced);
        assert_eq!(added.owner, device_id);
        assert!(store.pull_watermark().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_triggers_coalesce() {
        let server = Arc::new(FakeServer::default());
        let (engine, _, network, _) = harness(server);
        network.set_online(true);

        engine.running.store(true, Ordering::SeqCst);
        assert_eq!(engine.sync_now().await.unwrap(), CycleOutcome::Coalesced);
        assert!(engine.run_again.load(Ordering::SeqCst));
        engine.running.store(false, Ordering::SeqCst);
        engine.run_again.store(false, Ordering::SeqCst);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_coalesced_triggers_are_never_stranded() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        network.set_online(true);
        capture_entity(&store, json!({"site": "A"}), now_millis());

        // Hammer the engine from many tasks at once; a trigger that folds
        // into an active cycle must still get a cycle run on its behalf
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move { engine.sync_now().await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Once every trigger has returned, no run may be left flagged but
        // unserved, and the queue the triggers raced over is drained
        assert!(!engine.running.load(Ordering::SeqCst));
        assert!(!engine.run_again.load(Ordering::SeqCst));
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnect_triggers_sync_automatically() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let entity = capture_entity(&store, json!({"site": "A"}), now_millis());
        let _subscription = engine.attach_network_trigger();

        network.set_online(true);
        for _ in 0..200 {
            if store.count_pending().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.count_pending().unwrap(), 0);
        let entity = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_periodic_trigger_drains_queue() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        network.set_online(true);
        let entity = capture_entity(&store, json!({"site": "A"}), now_millis());

        let ticker = engine.spawn_periodic(Duration::from_millis(10));
        for _ in 0..200 {
            if store.count_pending().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ticker.abort();

        assert_eq!(store.count_pending().unwrap(), 0);
        let entity = store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_bundle_seeds_without_duplicates() {
        let server = Arc::new(FakeServer::default());
        server.seed_record("r1", "treatment", "srv-1", 3, json!({"site": "A"}));
        server.seed_record("r2", "applicator", "srv-2", 1, json!({"status": "LOADED"}));
        let (engine, store, network, _) = harness(Arc::clone(&server));
        network.set_online(true);

        assert_eq!(engine.download_bundle().await.unwrap(), 2);
        // Re-downloading the same snapshot adds nothing
        assert_eq!(engine.download_bundle().await.unwrap(), 0);

        let stats = store.get_storage_stats().unwrap();
        assert_eq!(stats.treatments, 1);
        assert_eq!(stats.applicators, 1);
        assert!(store.pull_watermark().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_acknowledgment_removes_entity() {
        let server = Arc::new(FakeServer::default());
        let (engine, store, network, _) = harness(Arc::clone(&server));
        let at = now_millis();
        let mut entity = LocalEntity::new_local(
            EntityType::Treatment,
            json!({"site": "A"}),
            "device-1",
            at,
            3_600_000,
        );
        entity.server_id = Some("srv-1".to_string());
        entity.version = 1;
        store.save_entity(&entity).unwrap();
        server.seed_record(&entity.local_id.as_str(), "treatment", "srv-1", 1, json!({"site": "A"}));
        store
            .enqueue_change(&PendingChange::new(
                OperationType::Delete,
                EntityType::Treatment,
                entity.local_id,
                serde_json::Value::Null,
                1,
                at,
            ))
            .unwrap();

        network.set_online(true);
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(s) if s.pushed == 1));
        assert!(store
            .get_entity(EntityType::Treatment, &entity.local_id)
            .unwrap()
            .is_none());
        assert!(server.record(&entity.local_id.as_str()).is_none());
    }
}
