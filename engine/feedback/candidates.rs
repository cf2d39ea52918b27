//! Enumerable neighborhood of parameter candidates around the live set.

use crate::module::{ScoringWeights, TuningParameters};

const THRESHOLD_STEP: f32 = 0.05;
const THRESHOLD_MIN: f32 = 0.05;
const THRESHOLD_MAX: f32 = 0.95;
const WEIGHT_STEP: f64 = 0.10;
const DECAY_STEP: f64 = 0.10;
const DECAY_MIN: f64 = 0.05;
const DECAY_MAX: f64 = 0.95;

/// One-step neighbors of `base`: threshold nudges, single-weight nudges
/// (renormalized), and decay nudges. Small by construction so every
/// candidate can be replayed each cycle.
#[must_use]
pub fn enumerate(base: &TuningParameters) -> Vec<TuningParameters> {
    let mut candidates = Vec::new();

    for step in [-THRESHOLD_STEP, THRESHOLD_STEP] {
        let threshold = (base.decomposition_threshold + step).clamp(THRESHOLD_MIN, THRESHOLD_MAX);
        if (threshold - base.decomposition_threshold).abs() > f32::EPSILON {
            let mut candidate = base.clone();
            candidate.decomposition_threshold = threshold;
            candidates.push(candidate);
        }
    }

    for nudge in weight_nudges(base.scoring) {
        let mut candidate = base.clone();
        candidate.scoring = nudge;
        candidates.push(candidate);
    }

    for step in [-DECAY_STEP, DECAY_STEP] {
        let decay = (base.ewma_decay + step).clamp(DECAY_MIN, DECAY_MAX);
        if (decay - base.ewma_decay).abs() > f64::EPSILON {
            let mut candidate = base.clone();
            candidate.ewma_decay = decay;
            candidates.push(candidate);
        }
    }

    candidates
}

fn weight_nudges(base: ScoringWeights) -> Vec<ScoringWeights> {
    let raise = |weights: ScoringWeights| weights.normalized();
    vec![
        raise(ScoringWeights {
            capability: base.capability + WEIGHT_STEP,
            ..base
        }),
        raise(ScoringWeights {
            load: base.load + WEIGHT_STEP,
            ..base
        }),
        raise(ScoringWeights {
            success_rate: base.success_rate + WEIGHT_STEP,
            ..base
        }),
        raise(ScoringWeights {
            latency: base.latency + WEIGHT_STEP,
            ..base
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighborhood_is_small_and_valid() {
        let base = TuningParameters::default();
        let candidates = enumerate(&base);
        assert!(!candidates.is_empty());
        assert!(candidates.len() <= 8);
        for candidate in &candidates {
            assert!((THRESHOLD_MIN..=THRESHOLD_MAX).contains(&candidate.decomposition_threshold));
            assert!((DECAY_MIN..=DECAY_MAX).contains(&candidate.ewma_decay));
            let w = candidate.scoring;
            let sum = w.capability + w.load + w.success_rate + w.latency;
            assert!(sum > 0.0);
            assert_ne!(candidate, &base);
        }
    }

    #[test]
    fn threshold_nudges_are_clamped_at_the_edges() {
        let mut base = TuningParameters::default();
        base.decomposition_threshold = THRESHOLD_MIN;
        let candidates = enumerate(&base);
        // The downward nudge collapses onto the floor and is dropped.
        assert!(candidates
            .iter()
            .all(|c| c.decomposition_threshold >= THRESHOLD_MIN));
        assert!(candidates
            .iter()
            .any(|c| c.decomposition_threshold > THRESHOLD_MIN));
    }

    #[test]
    fn weight_nudges_stay_normalized() {
        for candidate in weight_nudges(ScoringWeights::default()) {
            let sum = candidate.capability
                + candidate.load
                + candidate.success_rate
                + candidate.latency;
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }
}
