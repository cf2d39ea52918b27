//! Feedback loop: analyze recorded outcomes, trial parameter candidates
//! offline, deploy improvements, and roll back regressions.

/// Candidate enumeration.
pub mod candidates;
/// Offline replay scoring.
pub mod replay;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use uuid::Uuid;

use crate::module::{EngineError, ExecutionOutcome, ParameterStore, TuningParameters};
use crate::telemetry::EngineTelemetry;

/// Bounded, clone-shareable ring of recent execution outcomes.
#[derive(Debug, Clone)]
pub struct OutcomeHistory {
    inner: Arc<Mutex<VecDeque<ExecutionOutcome>>>,
    cap: usize,
    max_age: Option<chrono::Duration>,
}

impl Default for OutcomeHistory {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl OutcomeHistory {
    /// Creates a ring holding at most `cap` outcomes.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(cap.max(1)))),
            cap: cap.max(1),
            max_age: None,
        }
    }

    /// Additionally prunes outcomes older than `max_age` on every append.
    #[must_use]
    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Appends an outcome, evicting the oldest at capacity and any entries
    /// past the age limit.
    pub fn push(&self, outcome: ExecutionOutcome) {
        let mut inner = self.inner.lock();
        if let Some(max_age) = self.max_age {
            let cutoff = Utc::now() - max_age;
            while inner
                .front()
                .is_some_and(|oldest| oldest.recorded_at < cutoff)
            {
                inner.pop_front();
            }
        }
        if inner.len() == self.cap {
            inner.pop_front();
        }
        inner.push_back(outcome);
    }

    /// Chronological snapshot of the retained window.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ExecutionOutcome> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Number of retained outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Aggregate view of a window of outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowMetrics {
    /// Attempts in the window.
    pub count: usize,
    /// Fraction of successful attempts.
    pub success_rate: f64,
    /// Mean attempt duration in milliseconds.
    pub mean_duration_ms: f64,
}

impl WindowMetrics {
    /// Computes metrics over the given outcomes.
    #[must_use]
    pub fn from_outcomes(outcomes: &[ExecutionOutcome]) -> Self {
        if outcomes.is_empty() {
            return Self {
                count: 0,
                success_rate: 0.0,
                mean_duration_ms: 0.0,
            };
        }
        let successes = outcomes.iter().filter(|o| o.success).count();
        let total_ms: u64 = outcomes.iter().map(|o| o.duration_ms).sum();
        #[allow(clippy::cast_precision_loss)]
        Self {
            count: outcomes.len(),
            success_rate: successes as f64 / outcomes.len() as f64,
            mean_duration_ms: total_ms as f64 / outcomes.len() as f64,
        }
    }
}

/// Record of one parameter deployment, kept for audit and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    /// Deployment identifier.
    pub id: Uuid,
    /// When the swap happened.
    pub at: DateTime<Utc>,
    /// Parameters replaced.
    pub previous: TuningParameters,
    /// Parameters deployed.
    pub deployed: TuningParameters,
    /// Replay utility of the previous parameters.
    pub baseline_utility: f64,
    /// Replay utility of the deployed parameters.
    pub candidate_utility: f64,
    /// Whether monitoring later reverted this deployment.
    pub rolled_back: bool,
}

/// Tuning knobs for the feedback loop itself. These govern the loop's
/// caution, not the engine's behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Minimum retained outcomes before a cycle analyzes anything.
    pub min_window: usize,
    /// Fraction of the window held out for candidate validation.
    pub holdout_fraction: f64,
    /// Minimum replay-utility improvement required to deploy.
    pub deploy_margin: f64,
    /// Outcomes observed after a deployment before monitoring concludes.
    pub monitor_window: usize,
    /// Success-rate drop that triggers a rollback during monitoring.
    pub regression_tolerance: f64,
    /// Delay between background cycles.
    pub cycle_interval: Duration,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_window: 32,
            holdout_fraction: 0.3,
            deploy_margin: 0.02,
            monitor_window: 32,
            regression_tolerance: 0.05,
            cycle_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    deployment_id: Uuid,
    previous: Arc<TuningParameters>,
    baseline_success_rate: f64,
    history_len_at_deploy: usize,
}

/// Drives the analyze / hypothesize / replay / deploy / monitor cycle.
///
/// At most one deployment happens per cycle, and every deployment swaps a
/// whole immutable snapshot, so readers never observe a half-tuned set.
pub struct FeedbackLoop {
    history: OutcomeHistory,
    params: ParameterStore,
    config: FeedbackConfig,
    telemetry: Option<EngineTelemetry>,
    deployments: Mutex<Vec<DeploymentEvent>>,
    monitor: Mutex<Option<MonitorState>>,
}

impl std::fmt::Debug for FeedbackLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackLoop")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FeedbackLoop {
    /// Creates a loop over the given history and parameter store.
    #[must_use]
    pub fn new(
        history: OutcomeHistory,
        params: ParameterStore,
        config: FeedbackConfig,
        telemetry: Option<EngineTelemetry>,
    ) -> Self {
        Self {
            history,
            params,
            config,
            telemetry,
            deployments: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Deployments made so far, oldest first.
    #[must_use]
    pub fn deployments(&self) -> Vec<DeploymentEvent> {
        self.deployments.lock().clone()
    }

    /// Runs one full cycle. Returns the deployment made this cycle, if any.
    pub fn run_cycle(&self) -> Result<Option<DeploymentEvent>, EngineError> {
        let outcomes = self.history.snapshot();

        if self.monitor_active(&outcomes) {
            return Ok(None);
        }

        if outcomes.len() < self.config.min_window {
            self.emit(
                "feedback.cycle.skipped",
                json!({ "retained": outcomes.len(), "min_window": self.config.min_window }),
            );
            return Ok(None);
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let split = ((outcomes.len() as f64) * (1.0 - self.config.holdout_fraction)).round()
            as usize;
        let split = split.clamp(1, outcomes.len() - 1);
        let (train, holdout) = outcomes.split_at(split);

        let current = self.params.load();
        let baseline = replay::estimate_utility(&current, train, holdout);

        let mut best: Option<(TuningParameters, replay::ReplayEstimate)> = None;
        for candidate in candidates::enumerate(&current) {
            let estimate = replay::estimate_utility(&candidate, train, holdout);
            let improves = best
                .as_ref()
                .map_or(true, |(_, incumbent)| estimate.utility > incumbent.utility);
            if improves {
                best = Some((candidate, estimate));
            }
        }

        let Some((winner, winner_estimate)) = best else {
            return Ok(None);
        };
        let delta = winner_estimate.utility - baseline.utility;
        if delta <= self.config.deploy_margin {
            self.emit(
                "feedback.cycle.held",
                json!({
                    "baseline_utility": baseline.utility,
                    "best_utility": winner_estimate.utility,
                    "delta": delta,
                }),
            );
            return Ok(None);
        }

        let event = DeploymentEvent {
            id: Uuid::new_v4(),
            at: Utc::now(),
            previous: (*current).clone(),
            deployed: winner.clone(),
            baseline_utility: baseline.utility,
            candidate_utility: winner_estimate.utility,
            rolled_back: false,
        };
        let previous = self.params.swap(Arc::new(winner));
        *self.monitor.lock() = Some(MonitorState {
            deployment_id: event.id,
            previous,
            baseline_success_rate: WindowMetrics::from_outcomes(holdout).success_rate,
            history_len_at_deploy: outcomes.len(),
        });
        self.deployments.lock().push(event.clone());
        self.emit(
            "feedback.deploy",
            json!({
                "deployment": event.id,
                "baseline_utility": event.baseline_utility,
                "candidate_utility": event.candidate_utility,
            }),
        );
        self.log(
            LogLevel::Info,
            "feedback.deploy",
            json!({ "deployment": event.id, "delta": delta }),
        );
        Ok(Some(event))
    }

    /// Background loop. Cancel through the returned handle.
    #[must_use]
    pub fn spawn(self: Arc<Self>, interval: Duration) -> FeedbackHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                if let Err(err) = self.run_cycle() {
                    self.log(
                        LogLevel::Error,
                        "feedback.cycle.failed",
                        json!({ "error": err.to_string() }),
                    );
                }
            }
        });
        FeedbackHandle {
            stop: stop_tx,
            join,
        }
    }

    // True while a deployment is still under observation. Rolls back and
    // clears the monitor when the post-deploy window regresses.
    fn monitor_active(&self, outcomes: &[ExecutionOutcome]) -> bool {
        let mut guard = self.monitor.lock();
        let Some(state) = guard.as_ref() else {
            return false;
        };
        let observed = outcomes.len().saturating_sub(state.history_len_at_deploy);
        if observed == 0 {
            return true;
        }
        let window_start = outcomes.len() - observed.min(self.config.monitor_window);
        let recent = WindowMetrics::from_outcomes(&outcomes[window_start..]);

        if recent.success_rate < state.baseline_success_rate - self.config.regression_tolerance {
            let restored = Arc::clone(&state.previous);
            let deployment_id = state.deployment_id;
            self.params.swap(restored);
            if let Some(event) = self
                .deployments
                .lock()
                .iter_mut()
                .find(|event| event.id == deployment_id)
            {
                event.rolled_back = true;
            }
            self.emit(
                "feedback.rollback",
                json!({
                    "deployment": deployment_id,
                    "observed_success_rate": recent.success_rate,
                    "expected_success_rate": state.baseline_success_rate,
                }),
            );
            *guard = None;
            return true;
        }

        if observed >= self.config.monitor_window {
            self.emit(
                "feedback.monitor.passed",
                json!({ "deployment": state.deployment_id }),
            );
            *guard = None;
            return false;
        }
        true
    }

    fn emit(&self, kind: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.event(kind, payload);
        }
    }

    fn log(&self, level: LogLevel, message: &str, fields: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry.log(level, message, fields);
        }
    }
}

/// Stops the background feedback loop on demand.
#[derive(Debug)]
pub struct FeedbackHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FeedbackHandle {
    /// Signals the loop to stop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::WorkerId;
    use chrono::Utc;

    fn outcome(worker: WorkerId, success: bool, duration_ms: u64, complexity: f32) -> ExecutionOutcome {
        ExecutionOutcome {
            subtask_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            worker_id: worker,
            kind: "summarize".into(),
            complexity,
            success,
            duration_ms,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    fn feedback(history: OutcomeHistory, params: ParameterStore, config: FeedbackConfig) -> FeedbackLoop {
        FeedbackLoop::new(history, params, config, None)
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let history = OutcomeHistory::new(3);
        let worker = Uuid::new_v4();
        for i in 0..5 {
            history.push(outcome(worker, true, 100 + i, 0.2));
        }
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].duration_ms, 102);
        assert_eq!(snapshot[2].duration_ms, 104);
    }

    #[test]
    fn age_limit_prunes_stale_outcomes() {
        let history = OutcomeHistory::new(16).with_max_age(chrono::Duration::minutes(5));
        let worker = Uuid::new_v4();
        let mut stale = outcome(worker, true, 100, 0.2);
        stale.recorded_at = Utc::now() - chrono::Duration::minutes(10);
        history.push(stale);
        history.push(outcome(worker, true, 200, 0.2));

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].duration_ms, 200);
    }

    #[test]
    fn short_history_skips_the_cycle() {
        let history = OutcomeHistory::default();
        let worker = Uuid::new_v4();
        for _ in 0..8 {
            history.push(outcome(worker, true, 100, 0.2));
        }
        let feedback = feedback(
            history,
            ParameterStore::default(),
            FeedbackConfig::default(),
        );
        assert!(feedback.run_cycle().unwrap().is_none());
        assert!(feedback.deployments().is_empty());
    }

    #[test]
    fn flat_history_never_deploys() {
        let history = OutcomeHistory::default();
        let worker = Uuid::new_v4();
        for _ in 0..64 {
            history.push(outcome(worker, true, 100, 0.2));
        }
        let params = ParameterStore::default();
        let before = params.load();
        let feedback = feedback(history, params.clone(), FeedbackConfig::default());

        for _ in 0..4 {
            assert!(feedback.run_cycle().unwrap().is_none());
        }
        assert!(feedback.deployments().is_empty());
        assert_eq!(*params.load(), *before);
    }

    #[test]
    fn clear_improvement_deploys_exactly_once_per_cycle() {
        let history = OutcomeHistory::default();
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();
        for _ in 0..40 {
            history.push(outcome(good, true, 50, 0.2));
            history.push(outcome(bad, false, 4000, 0.2));
        }
        let params = ParameterStore::default();
        let config = FeedbackConfig {
            deploy_margin: 0.001,
            ..FeedbackConfig::default()
        };
        let feedback = feedback(history, params.clone(), config);

        let event = feedback.run_cycle().unwrap().expect("deployment");
        assert!(event.candidate_utility > event.baseline_utility);
        assert!(!event.rolled_back);
        assert_eq!(feedback.deployments().len(), 1);

        // Readers see either the old or the new snapshot, never a blend.
        let live = params.load();
        assert!(*live == event.deployed || *live == event.previous);
        assert_eq!(*live, event.deployed);
    }

    #[test]
    fn slow_near_threshold_traffic_deploys_a_lower_threshold() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let history = OutcomeHistory::default();
        let worker = Uuid::new_v4();
        // Work just under the split threshold runs long; cheap work is fast.
        for _ in 0..40 {
            history.push(outcome(worker, true, 4000, 0.42));
            history.push(outcome(worker, true, 100, 0.2));
        }
        let params = ParameterStore::default();
        let before = params.load();
        let feedback = feedback(history, params.clone(), FeedbackConfig::default());

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let params = params.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while !stop.load(Ordering::Relaxed) {
                    seen.push(params.load());
                }
                seen
            })
        };

        let event = feedback.run_cycle().unwrap().expect("deployment");
        stop.store(true, Ordering::Relaxed);
        let seen = reader.join().unwrap();

        assert_eq!(feedback.deployments().len(), 1);
        assert!(event.candidate_utility > event.baseline_utility);
        assert!(event.deployed.decomposition_threshold < before.decomposition_threshold);
        // Concurrent readers only ever see whole snapshots.
        assert!(seen
            .iter()
            .all(|snap| **snap == event.previous || **snap == event.deployed));
    }

    #[test]
    fn regression_during_monitoring_rolls_back() {
        let history = OutcomeHistory::default();
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();
        for _ in 0..40 {
            history.push(outcome(good, true, 50, 0.2));
            history.push(outcome(bad, false, 4000, 0.2));
        }
        let params = ParameterStore::default();
        let config = FeedbackConfig {
            deploy_margin: 0.001,
            monitor_window: 16,
            ..FeedbackConfig::default()
        };
        let feedback = feedback(history.clone(), params.clone(), config);

        let event = feedback.run_cycle().unwrap().expect("deployment");
        // Everything fails after the deploy.
        for _ in 0..16 {
            history.push(outcome(good, false, 50, 0.2));
        }
        assert!(feedback.run_cycle().unwrap().is_none());

        let deployments = feedback.deployments();
        assert!(deployments[0].rolled_back);
        assert_eq!(*params.load(), event.previous);
    }

    #[test]
    fn monitoring_passes_when_quality_holds() {
        let history = OutcomeHistory::default();
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();
        for _ in 0..40 {
            history.push(outcome(good, true, 50, 0.2));
            history.push(outcome(bad, false, 4000, 0.2));
        }
        let params = ParameterStore::default();
        let config = FeedbackConfig {
            deploy_margin: 0.001,
            monitor_window: 8,
            ..FeedbackConfig::default()
        };
        let feedback = feedback(history.clone(), params.clone(), config);

        let event = feedback.run_cycle().unwrap().expect("deployment");
        // Post-deploy traffic looks like the pre-deploy mix.
        for _ in 0..8 {
            history.push(outcome(good, true, 50, 0.2));
            history.push(outcome(bad, false, 4000, 0.2));
        }
        feedback.run_cycle().unwrap();

        assert!(!feedback.deployments()[0].rolled_back);
        assert_ne!(*params.load(), event.previous);
    }
}
