//! Bounded exponential backoff with jitter for bus reconnection.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound of any delay.
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based) using a random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Delay before retry number `attempt` for a given `random` in `[0, 1)`.
    ///
    /// `base * 2^attempt`, capped at the maximum, then scaled by
    /// `1 + (random * 2 - 1) * jitter` and capped again.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
        let capped = exponential.min(max_ms);

        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor.clamp(0.0, 1.0);
        let with_jitter = ((capped as f64) * jitter).round().max(0.0) as u64;

        Duration::from_millis(with_jitter.min(max_ms))
    }
}
