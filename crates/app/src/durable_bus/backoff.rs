//! Exponential reconnect backoff with multiplicative jitter.

use std::time::Duration;

use rand::Rng;

use super::config::ReconnectConfig;

/// Lowest and highest jitter factors (±50%).
const JITTER: (f64, f64) = (0.5, 1.5);

/// Delay schedule: `min(initial × multiplier^attempt, max)`, then jittered.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Un-jittered delay before attempt number `attempt` (zero-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }

    /// Jittered delay before attempt number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(JITTER.0..=JITTER.1);
        jittered(self.base_delay(attempt), factor)
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        )
    }
}

fn jittered(base: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
}
