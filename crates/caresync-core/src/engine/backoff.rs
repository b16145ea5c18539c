//! Retry backoff math.
//!
//! Delay computation is a pure function of the retry count so it can be
//! unit-tested without timers; the Sync Engine owns the scheduling.

use rand::Rng;

/// Tuning for retry delays and the intervention threshold
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry (ms)
    pub base_ms: u64,
    /// Ceiling for the exponential curve (ms)
    pub cap_ms: u64,
    /// Jitter applied as ± this fraction of the computed delay
    pub jitter_ratio: f64,
    /// Retries past this count freeze the change for an operator
    pub intervention_threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.2,
            intervention_threshold: 10,
        }
    }
}

impl BackoffConfig {
    /// Deterministic delay before retry number `retry_count`:
    /// `base * 2^retry_count`, capped.
    #[must_use]
    pub fn next_delay_ms(&self, retry_count: u32) -> u64 {
        let exp = retry_count.min(63);
        self.base_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX))
            .min(self.cap_ms)
    }

    /// `next_delay_ms` with random ± jitter, still capped.
    #[must_use]
    pub fn next_delay_jittered_ms(&self, retry_count: u32, rng: &mut impl Rng) -> u64 {
        let delay = self.next_delay_ms(retry_count);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let spread = (delay as f64 * self.jitter_ratio) as u64;
        if spread == 0 {
            return delay;
        }
        let jitter = rng.gen_range(0..=spread * 2);
        (delay + jitter).saturating_sub(spread).min(self.cap_ms)
    }

    /// Whether a change with this many failures is past saving by retry.
    #[must_use]
    pub const fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.intervention_threshold
    }
}
