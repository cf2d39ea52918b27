//! Built-in worker executors for development, demos, and tests.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde_json::json;
use tokio::time::sleep;

use crate::dispatch::supervisor::{WorkAssignment, WorkerExecutor, WorkerFailure};

/// Echoes the assignment payload back immediately. Useful as the simplest
/// possible collaborator in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackExecutor;

#[async_trait]
impl WorkerExecutor for LoopbackExecutor {
    async fn run(&self, assignment: WorkAssignment) -> Result<serde_json::Value, WorkerFailure> {
        Ok(json!({
            "kind": assignment.kind,
            "echo": assignment.payload,
        }))
    }
}

/// Simulates a fleet with latency jitter and a uniform failure probability.
/// Seedable, so demo runs are reproducible.
#[derive(Debug)]
pub struct SimulatedExecutor {
    latency_ms: (u64, u64),
    failure_rate: f64,
    rng: Mutex<SmallRng>,
}

impl SimulatedExecutor {
    /// Creates a simulator with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            latency_ms: (5, 25),
            failure_rate: 0.0,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    /// Sets the latency jitter range in milliseconds.
    #[must_use]
    pub const fn with_latency(mut self, low_ms: u64, high_ms: u64) -> Self {
        self.latency_ms = (low_ms, high_ms);
        self
    }

    /// Sets the probability that any attempt fails.
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl WorkerExecutor for SimulatedExecutor {
    async fn run(&self, assignment: WorkAssignment) -> Result<serde_json::Value, WorkerFailure> {
        let (delay, fail) = {
            let mut rng = self.rng.lock();
            let (low, high) = self.latency_ms;
            let delay = if high > low {
                rng.gen_range(low..=high)
            } else {
                low
            };
            (delay, self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate))
        };
        sleep(Duration::from_millis(delay)).await;
        if fail {
            return Err(WorkerFailure::Execution(format!(
                "simulated failure on {}",
                assignment.description
            )));
        }
        Ok(json!({
            "kind": assignment.kind,
            "simulated_latency_ms": delay,
        }))
    }
}

/// Fails specific subtasks (matched by description) a scripted number of
/// times before succeeding. Deterministic scenario driver for tests.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failures: Mutex<IndexMap<String, u32>>,
    latency_ms: u64,
}

impl ScriptedExecutor {
    /// Creates an executor that succeeds immediately for every assignment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed latency to every attempt.
    #[must_use]
    pub const fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Scripts the next `count` attempts on the described subtask to fail.
    #[must_use]
    pub fn failing(self, description: impl Into<String>, count: u32) -> Self {
        self.failures.lock().insert(description.into(), count);
        self
    }
}

#[async_trait]
impl WorkerExecutor for ScriptedExecutor {
    async fn run(&self, assignment: WorkAssignment) -> Result<serde_json::Value, WorkerFailure> {
        if self.latency_ms > 0 {
            sleep(Duration::from_millis(self.latency_ms)).await;
        }
        let should_fail = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&assignment.description) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(WorkerFailure::Execution(format!(
                "scripted failure on {}",
                assignment.description
            )));
        }
        Ok(json!({ "done": assignment.description }))
    }
}
