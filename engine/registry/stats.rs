//! Running statistics for worker performance history.

use serde::{Deserialize, Serialize};

/// Exponentially weighted moving average over a stream of samples.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Ewma {
    value: Option<f64>,
}

impl Ewma {
    /// Folds one sample in with the given decay factor in (0, 1].
    pub fn push(&mut self, sample: f64, decay: f64) {
        let decay = decay.clamp(f64::EPSILON, 1.0);
        self.value = Some(match self.value {
            Some(prev) => decay.mul_add(sample - prev, prev),
            None => sample,
        });
    }

    /// Current average, if any sample has been observed.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        self.value
    }

    /// Current average, or the provided prior when empty.
    #[must_use]
    pub fn value_or(&self, prior: f64) -> f64 {
        self.value.unwrap_or(prior)
    }
}

/// Per-skill performance history for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillStats {
    /// Declared proficiency in [0, 1].
    pub proficiency: f32,
    /// Running success rate in [0, 1].
    pub success_rate: Ewma,
    /// Running mean attempt latency in milliseconds.
    pub latency_ms: Ewma,
}

impl SkillStats {
    /// Creates stats for a declared proficiency, clamped to [0, 1].
    #[must_use]
    pub fn new(proficiency: f32) -> Self {
        Self {
            proficiency: proficiency.clamp(0.0, 1.0),
            success_rate: Ewma::default(),
            latency_ms: Ewma::default(),
        }
    }

    /// Folds one attempt into the running statistics.
    pub fn observe(&mut self, success: bool, duration_ms: u64, decay: f64) {
        self.success_rate
            .push(if success { 1.0 } else { 0.0 }, decay);
        #[allow(clippy::cast_precision_loss)]
        self.latency_ms.push(duration_ms as f64, decay);
    }
}
