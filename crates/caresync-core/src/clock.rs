//! Clock Service: server-relative time despite unreliable device clocks.
//!
//! One NTP-style sample per sync: local send time `t0`, server time `ts`,
//! local receive time `t1`. Round-trip is `t1 - t0` and the offset is
//! `ts - (t0 + rt/2)`. Every timestamp the core produces goes through
//! `adjusted_time`.

use std::sync::Mutex;

use crate::api::SyncApi;
use crate::error::Result;

/// Source of local wall-clock readings. Injectable so tests can skew the
/// device clock without touching the system.
pub trait TimeSource: Send + Sync {
    /// Current local time in Unix milliseconds
    fn now_millis(&self) -> i64;
}

/// The real device clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Tuning for when a fresh time sync is wanted
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Round-trips above this make the sample suspect
    pub max_round_trip_ms: i64,
    /// Re-sync after this much time on one sample
    pub max_sample_age_ms: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_round_trip_ms: 2_000,
            max_sample_age_ms: 15 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ClockState {
    offset_ms: i64,
    last_round_trip_ms: i64,
    /// Local time of the last successful sample, None before the first
    last_synced_at: Option<i64>,
    /// False until one successful sync; degraded again by a failed one
    reliable: bool,
}

/// Estimates the offset between the device clock and the server clock.
pub struct ClockService {
    time_source: Box<dyn TimeSource>,
    config: ClockConfig,
    state: Mutex<ClockState>,
}

impl ClockService {
    /// Clock service over the real device clock.
    #[must_use]
    pub fn new(config: ClockConfig) -> Self {
        Self::with_time_source(SystemTimeSource, config)
    }

    /// Clock service over an injected local time source.
    #[must_use]
    pub fn with_time_source(time_source: impl TimeSource + 'static, config: ClockConfig) -> Self {
        Self {
            time_source: Box::new(time_source),
            config,
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Take one offset sample from the server time endpoint.
    ///
    /// On failure the previous offset is retained and reliability
    /// degrades; nothing else in the system is blocked.
    pub async fn sync(&self, api: &dyn SyncApi) -> Result<()> {
        let t0 = self.time_source.now_millis();
        let response = match api.server_time().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("time sync failed, keeping previous offset: {e}");
                self.state().reliable = false;
                return Err(e);
            }
        };
        let t1 = self.time_source.now_millis();

        let round_trip = t1 - t0;
        let offset = response.server_time - (t0 + round_trip / 2);

        let mut state = self.state();
        state.offset_ms = offset;
        state.last_round_trip_ms = round_trip;
        state.last_synced_at = Some(t1);
        state.reliable = true;
        tracing::debug!(offset_ms = offset, round_trip_ms = round_trip, "clock synced");
        Ok(())
    }

    /// Local wall-clock time corrected by the estimated offset.
    pub fn adjusted_time(&self) -> i64 {
        let offset = self.state().offset_ms;
        self.time_source.now_millis() + offset
    }

    /// Whether timestamps from `adjusted_time` can be trusted.
    pub fn is_reliable(&self) -> bool {
        self.state().reliable
    }

    /// Whether a fresh sample is wanted: never synced, the last round-trip
    /// was too long, or the sample is stale.
    pub fn needs_sync(&self) -> bool {
        let now = self.time_source.now_millis();
        let state = self.state();
        match state.last_synced_at {
            None => true,
            Some(at) => {
                state.last_round_trip_ms > self.config.max_round_trip_ms
                    || now - at > self.config.max_sample_age_ms
            }
        }
    }

    #[allow(clippy::mut_mutex_lock)]
    fn state(&self) -> std::sync::MutexGuard<'_, ClockState> {
        // A poisoned lock only ever holds a fully-written sample
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        BundleResponse, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
        ServerConflict, ServerSyncStatus, TimeResponse,
    };
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    /// Device clock with adjustable skew against "true" time
    struct SkewedClock {
        true_time: Arc<AtomicI64>,
        skew_ms: i64,
    }

    impl TimeSource for SkewedClock {
        fn now_millis(&self) -> i64 {
            self.true_time.load(Ordering::SeqCst) + self.skew_ms
        }
    }

    /// Time endpoint serving true time, advancing it to simulate latency
    struct FakeTimeApi {
        true_time: Arc<AtomicI64>,
        one_way_latency_ms: i64,
        fail: bool,
    }

    #[async_trait]
    impl SyncApi for FakeTimeApi {
        async fn push(&self, _request: &PushRequest) -> crate::error::Result<PushResponse> {
            unreachable!("not used in clock tests")
        }
        async fn pull(&self, _d: &str, _s: i64) -> crate::error::Result<PullResponse> {
            unreachable!("not used in clock tests")
        }
        async fn status(&self, _d: &str) -> crate::error::Result<ServerSyncStatus> {
            unreachable!("not used in clock tests")
        }
        async fn download_bundle(&self, _d: &str) -> crate::error::Result<BundleResponse> {
            unreachable!("not used in clock tests")
        }
        async fn list_conflicts(&self) -> crate::error::Result<Vec<ServerConflict>> {
            unreachable!("not used in clock tests")
        }
        async fn resolve_conflict(
            &self,
            _id: &str,
            _r: &ResolveConflictRequest,
        ) -> crate::error::Result<()> {
            unreachable!("not used in clock tests")
        }
        async fn server_time(&self) -> crate::error::Result<TimeResponse> {
            if self.fail {
                return Err(Error::Network("time endpoint unreachable".into()));
            }
            // Request travels one way, is answered, travels back
            self.true_time
                .fetch_add(self.one_way_latency_ms, Ordering::SeqCst);
            let server_time = self.true_time.load(Ordering::SeqCst);
            self.true_time
                .fetch_add(self.one_way_latency_ms, Ordering::SeqCst);
            Ok(TimeResponse {
                timestamp: server_time,
                server_time,
            })
        }
    }

    fn setup(skew_ms: i64, one_way_latency_ms: i64) -> (ClockService, FakeTimeApi, Arc<AtomicI64>) {
        let true_time = Arc::new(AtomicI64::new(1_700_000_000_000));
        let clock = ClockService::with_time_source(
            SkewedClock {
                true_time: true_time.clone(),
                skew_ms,
            },
            ClockConfig::default(),
        );
        let api = FakeTimeApi {
            true_time: true_time.clone(),
            one_way_latency_ms,
            fail: false,
        };
        (clock, api, true_time)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreliable_until_first_sync() {
        let (clock, api, _) = setup(0, 10);
        assert!(!clock.is_reliable());
        assert!(clock.needs_sync());

        clock.sync(&api).await.unwrap();
        assert!(clock.is_reliable());
        assert!(!clock.needs_sync());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_converges_with_large_skew() {
        // Device clock runs two minutes fast; 20 ms each way on the wire
        let (clock, api, true_time) = setup(120_000, 20);
        clock.sync(&api).await.unwrap();

        let adjusted = clock.adjusted_time();
        let truth = true_time.load(Ordering::SeqCst);
        assert!(
            (adjusted - truth).abs() <= 500,
            "adjusted {adjusted} vs true {truth}"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_symmetric_round_trip_cancels_out() {
        let (clock, api, true_time) = setup(-45_000, 20);
        clock.sync(&api).await.unwrap();

        // rt = 40 ms, symmetric: the estimate should be near exact
        let diff = clock.adjusted_time() - true_time.load(Ordering::SeqCst);
        assert!(diff.abs() <= 5, "diff {diff}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_retains_offset_and_degrades() {
        let (clock, mut api, _) = setup(120_000, 10);
        clock.sync(&api).await.unwrap();
        let offset_before = clock.adjusted_time() - 120_000;

        api.fail = true;
        assert!(clock.sync(&api).await.is_err());
        assert!(!clock.is_reliable());
        // Previous offset still applied
        let offset_after = clock.adjusted_time() - 120_000;
        assert!((offset_after - offset_before).abs() <= 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_needs_sync_after_long_round_trip() {
        let true_time = Arc::new(AtomicI64::new(1_700_000_000_000));
        let clock = ClockService::with_time_source(
            SkewedClock {
                true_time: true_time.clone(),
                skew_ms: 0,
            },
            ClockConfig {
                max_round_trip_ms: 100,
                ..ClockConfig::default()
            },
        );
        let api = FakeTimeApi {
            true_time,
            one_way_latency_ms: 80, // rt = 160 ms, over the threshold
            fail: false,
        };
        clock.sync(&api).await.unwrap();
        assert!(clock.is_reliable());
        assert!(clock.needs_sync());
    }
}
