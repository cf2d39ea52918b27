//! Exponential backoff with full jitter between retry attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff: the delay window doubles per attempt up to a cap,
/// and each delay is drawn uniformly from the window to spread out retries.
/// The constants are configuration, not contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 200,
            cap_ms: 10_000,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay window before retry number `attempt`
    /// (1-indexed), in milliseconds.
    #[must_use]
    pub const fn window_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let exponent = if exponent > 32 { 32 } else { exponent };
        let window = self.base_ms.saturating_mul(1_u64 << exponent);
        if window > self.cap_ms {
            self.cap_ms
        } else {
            window
        }
    }

    /// Jittered delay before retry number `attempt`: uniform over the
    /// current window.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let window = self.window_ms(attempt);
        Duration::from_millis(rand::thread_rng().gen_range(0..=window))
    }
}
