//! Capability registry: which workers can do what, and how well.

/// Running statistics primitives.
pub mod stats;

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stats::SkillStats;
use uuid::Uuid;

use crate::module::{EngineError, ExecutionOutcome, ParameterStore, WorkerId};

/// Declaration of a worker and its skills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Unique identifier.
    pub id: WorkerId,
    /// Friendly name.
    pub name: String,
    /// Skill name to declared proficiency in [0, 1].
    pub skills: IndexMap<String, f32>,
    /// Maximum concurrent subtasks.
    pub max_concurrency: u32,
}

impl WorkerProfile {
    /// Creates a profile with a fresh id and no skills.
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrency: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            skills: IndexMap::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Declares a skill, clamping proficiency into [0, 1].
    #[must_use]
    pub fn with_skill(mut self, skill: impl Into<String>, proficiency: f32) -> Self {
        self.skills.insert(skill.into(), proficiency.clamp(0.0, 1.0));
        self
    }
}

/// Observable view of one registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    /// Worker identifier.
    pub id: WorkerId,
    /// Friendly name.
    pub name: String,
    /// Subtasks currently in flight.
    pub in_flight: u32,
    /// Concurrency cap.
    pub max_concurrency: u32,
    /// Per-skill statistics.
    pub skills: IndexMap<String, SkillStats>,
}

#[derive(Debug)]
struct WorkerEntry {
    profile: WorkerProfile,
    stats: IndexMap<String, SkillStats>,
    in_flight: u32,
}

impl WorkerEntry {
    fn new(profile: WorkerProfile) -> Self {
        let stats = profile
            .skills
            .iter()
            .map(|(skill, proficiency)| (skill.clone(), SkillStats::new(*proficiency)))
            .collect();
        Self {
            profile,
            stats,
            in_flight: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.in_flight < self.profile.max_concurrency
    }
}

/// Authoritative map of workers, their skills, load, and performance history.
///
/// Clone-shareable; all mutation happens under one internal lock so that a
/// dispatch decision (select + reserve) is atomic.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RwLock<IndexMap<WorkerId, WorkerEntry>>>,
    params: ParameterStore,
}

impl CapabilityRegistry {
    /// Creates an empty registry reading weights from the given store.
    #[must_use]
    pub fn new(params: ParameterStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(IndexMap::new())),
            params,
        }
    }

    /// Registers a worker. Fails if the id is already present.
    pub fn register(&self, profile: WorkerProfile) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        if inner.contains_key(&profile.id) {
            return Err(EngineError::DuplicateWorker(profile.id));
        }
        inner.insert(profile.id, WorkerEntry::new(profile));
        Ok(())
    }

    /// Deregisters a worker. Fails while it still holds in-flight work; the
    /// caller must drain first.
    pub fn deregister(&self, id: WorkerId) -> Result<WorkerProfile, EngineError> {
        let mut inner = self.inner.write();
        let entry = inner.get(&id).ok_or(EngineError::WorkerNotFound(id))?;
        if entry.in_flight > 0 {
            return Err(EngineError::WorkerBusy {
                id,
                in_flight: entry.in_flight,
            });
        }
        Ok(inner.shift_remove(&id).map(|e| e.profile).unwrap_or_else(|| {
            unreachable!("entry existence checked under the same write lock")
        }))
    }

    /// Scores eligible workers for the given skill set and reserves a slot on
    /// the winner in one atomic step.
    ///
    /// Eligibility requires every listed skill and spare concurrency. Ties
    /// break by lowest in-flight count, then by id, so selection is
    /// deterministic.
    pub fn select_and_reserve(
        &self,
        kind: &str,
        extra_skills: &[String],
    ) -> Result<WorkerId, EngineError> {
        let weights = self.params.load().scoring.normalized();
        let mut inner = self.inner.write();

        let mut candidates: Vec<(f64, u32, WorkerId)> = Vec::new();
        for entry in inner.values() {
            if !entry.has_capacity() {
                continue;
            }
            let Some(score) = score_entry(entry, kind, extra_skills, &weights) else {
                continue;
            };
            candidates.push((score, entry.in_flight, entry.profile.id));
        }
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let Some(&(_, _, winner)) = candidates.first() else {
            return Err(EngineError::NoEligibleWorker(kind.to_string()));
        };
        inner
            .get_mut(&winner)
            .unwrap_or_else(|| unreachable!("winner taken from the locked map"))
            .in_flight += 1;
        Ok(winner)
    }

    /// Releases one reserved slot after an attempt finishes.
    pub fn release(&self, id: WorkerId) {
        if let Some(entry) = self.inner.write().get_mut(&id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Folds an attempt outcome into the worker's running statistics.
    pub fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<(), EngineError> {
        let decay = self.params.load().ewma_decay;
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(&outcome.worker_id)
            .ok_or(EngineError::WorkerNotFound(outcome.worker_id))?;
        entry
            .stats
            .entry(outcome.kind.clone())
            .or_insert_with(|| SkillStats::new(0.5))
            .observe(outcome.success, outcome.duration_ms, decay);
        Ok(())
    }

    /// Current in-flight count for a worker.
    pub fn in_flight(&self, id: WorkerId) -> Result<u32, EngineError> {
        self.inner
            .read()
            .get(&id)
            .map(|entry| entry.in_flight)
            .ok_or(EngineError::WorkerNotFound(id))
    }

    /// Snapshot of every registered worker.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerView> {
        self.inner
            .read()
            .values()
            .map(|entry| WorkerView {
                id: entry.profile.id,
                name: entry.profile.name.clone(),
                in_flight: entry.in_flight,
                max_concurrency: entry.profile.max_concurrency,
                skills: entry.stats.clone(),
            })
            .collect()
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no worker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn score_entry(
    entry: &WorkerEntry,
    kind: &str,
    extra_skills: &[String],
    weights: &crate::module::ScoringWeights,
) -> Option<f64> {
    let mut proficiencies = Vec::with_capacity(1 + extra_skills.len());
    proficiencies.push(*entry.profile.skills.get(kind)?);
    for skill in extra_skills {
        proficiencies.push(*entry.profile.skills.get(skill)?);
    }
    #[allow(clippy::cast_precision_loss)]
    let capability =
        f64::from(proficiencies.iter().sum::<f32>()) / proficiencies.len() as f64;

    let load_term = 1.0 - f64::from(entry.in_flight) / f64::from(entry.profile.max_concurrency);

    let stats = entry.stats.get(kind);
    // Until history accrues, the declared proficiency is the optimistic prior.
    let success = stats
        .and_then(|s| s.success_rate.value())
        .unwrap_or(capability);
    let latency_term = stats
        .and_then(|s| s.latency_ms.value())
        .map_or(0.5, |ms| 1.0 / (1.0 + ms / 1000.0));

    Some(
        weights.capability * capability
            + weights.load * load_term
            + weights.success_rate * success
            + weights.latency * latency_term,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::TuningParameters;
    use chrono::Utc;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(ParameterStore::new(TuningParameters::default()))
    }

    fn outcome(worker_id: WorkerId, kind: &str, success: bool, duration_ms: u64) -> ExecutionOutcome {
        ExecutionOutcome {
            subtask_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            worker_id,
            kind: kind.into(),
            complexity: 0.3,
            success,
            duration_ms,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = registry();
        let profile = WorkerProfile::new("alpha", 2).with_skill("summarize", 0.9);
        registry.register(profile.clone()).unwrap();
        assert!(matches!(
            registry.register(profile),
            Err(EngineError::DuplicateWorker(_))
        ));
    }

    #[test]
    fn deregister_requires_drained_worker() {
        let registry = registry();
        let profile = WorkerProfile::new("alpha", 2).with_skill("summarize", 0.9);
        let id = profile.id;
        registry.register(profile).unwrap();

        let picked = registry.select_and_reserve("summarize", &[]).unwrap();
        assert_eq!(picked, id);
        assert!(matches!(
            registry.deregister(id),
            Err(EngineError::WorkerBusy { .. })
        ));

        registry.release(id);
        assert!(registry.deregister(id).is_ok());
    }

    #[test]
    fn selection_favors_stronger_worker() {
        let registry = registry();
        let strong = WorkerProfile::new("strong", 4).with_skill("summarize", 0.9);
        let weak = WorkerProfile::new("weak", 4).with_skill("summarize", 0.4);
        let strong_id = strong.id;
        registry.register(strong).unwrap();
        registry.register(weak).unwrap();

        let picked = registry.select_and_reserve("summarize", &[]).unwrap();
        assert_eq!(picked, strong_id);
    }

    #[test]
    fn saturated_worker_falls_back_to_next_best() {
        let registry = registry();
        let strong = WorkerProfile::new("strong", 1).with_skill("summarize", 0.9);
        let weak = WorkerProfile::new("weak", 4).with_skill("summarize", 0.4);
        let strong_id = strong.id;
        let weak_id = weak.id;
        registry.register(strong).unwrap();
        registry.register(weak).unwrap();

        assert_eq!(registry.select_and_reserve("summarize", &[]).unwrap(), strong_id);
        // Strong is now at capacity; the weaker worker absorbs the overflow.
        assert_eq!(registry.select_and_reserve("summarize", &[]).unwrap(), weak_id);
    }

    #[test]
    fn missing_skill_means_no_eligible_worker() {
        let registry = registry();
        registry
            .register(WorkerProfile::new("alpha", 2).with_skill("summarize", 0.9))
            .unwrap();
        assert!(matches!(
            registry.select_and_reserve("translate", &[]),
            Err(EngineError::NoEligibleWorker(_))
        ));
    }

    #[test]
    fn recorded_outcomes_shift_selection() {
        let registry = registry();
        let a = WorkerProfile::new("a", 8).with_skill("summarize", 0.6);
        let b = WorkerProfile::new("b", 8).with_skill("summarize", 0.6);
        let a_id = a.id;
        let b_id = b.id;
        registry.register(a).unwrap();
        registry.register(b).unwrap();

        for _ in 0..12 {
            registry.record_outcome(&outcome(a_id, "summarize", true, 50)).unwrap();
            registry.record_outcome(&outcome(b_id, "summarize", false, 4000)).unwrap();
        }
        let picked = registry.select_and_reserve("summarize", &[]).unwrap();
        assert_eq!(picked, a_id);
    }

    #[test]
    fn tie_break_is_deterministic_by_load_then_id() {
        let registry = registry();
        let mut a = WorkerProfile::new("a", 4).with_skill("summarize", 0.7);
        let mut b = WorkerProfile::new("b", 4).with_skill("summarize", 0.7);
        a.id = Uuid::from_u128(1);
        b.id = Uuid::from_u128(2);
        registry.register(a).unwrap();
        registry.register(b).unwrap();

        // Identical scores: lowest id wins, then load shifts the balance.
        assert_eq!(registry.select_and_reserve("summarize", &[]).unwrap(), Uuid::from_u128(1));
        assert_eq!(registry.select_and_reserve("summarize", &[]).unwrap(), Uuid::from_u128(2));
    }
}
