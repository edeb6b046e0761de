//! Reconnect policy with jittered exponential back-off.

use std::time::Duration;

/// Controls how long the heartbeat client waits between registry dials.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectBackoff {
    /// A policy with a fixed delay and no growth. Mostly for tests.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
        }
    }

    /// Compute the delay for the given attempt number (0-indexed).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(32) as i32;
        let delay_ms = base_ms * self.backoff_factor.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Up to 25% jitter spreads reconnect storms across providers.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Deterministic fraction in [0, 1) derived from the attempt number.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2_654_435_761);
    f64::from(hash) / f64::from(u32::MAX)
}
