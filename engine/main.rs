//! Runtime facade wiring registry, graph builder, scheduler, and feedback
//! loop into one embeddable engine.

use std::sync::Arc;

use crate::dispatch::{
    backoff::BackoffPolicy,
    supervisor::{ExecutionSupervisor, SupervisorConfig, WorkerExecutor},
    Scheduler, SchedulerConfig, TaskSnapshot,
};
use crate::feedback::{DeploymentEvent, FeedbackConfig, FeedbackHandle, FeedbackLoop, OutcomeHistory};
use crate::graph::builder::{GraphBuilder, Strategy};
use crate::module::{
    EngineError, EngineLimits, ParameterStore, TaskId, TaskRequest, TuningParameters, WorkerId,
};
use crate::persistence::{MemoryTaskStore, TaskStore};
use crate::registry::{CapabilityRegistry, WorkerProfile, WorkerView};
use crate::telemetry::EngineTelemetry;
use crate::workers::SimulatedExecutor;

/// Builder for [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    executor: Arc<dyn WorkerExecutor>,
    store: Arc<dyn TaskStore>,
    params: TuningParameters,
    limits: EngineLimits,
    supervisor_config: SupervisorConfig,
    scheduler_config: SchedulerConfig,
    feedback_config: FeedbackConfig,
    backoff: BackoffPolicy,
    history_capacity: usize,
    strategies: Vec<(String, Strategy)>,
    default_strategy: Strategy,
    telemetry: Option<EngineTelemetry>,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRuntimeBuilder {
    /// Starts a builder with in-memory persistence and a seeded simulator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: Arc::new(SimulatedExecutor::new(0)),
            store: Arc::new(MemoryTaskStore::new()),
            params: TuningParameters::default(),
            limits: EngineLimits::default(),
            supervisor_config: SupervisorConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            feedback_config: FeedbackConfig::default(),
            backoff: BackoffPolicy::default(),
            history_capacity: 1024,
            strategies: Vec::new(),
            default_strategy: Strategy::Sequential,
            telemetry: None,
        }
    }

    /// Sets the worker executor backing the fleet.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the durable store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = store;
        self
    }

    /// Seeds the tunable parameters.
    #[must_use]
    pub fn parameters(mut self, params: TuningParameters) -> Self {
        self.params = params;
        self
    }

    /// Sets submission-time limits.
    #[must_use]
    pub const fn limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets attempt timeout and cancellation discipline.
    #[must_use]
    pub const fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = config;
        self
    }

    /// Sets scheduler timing knobs.
    #[must_use]
    pub const fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Sets feedback loop caution knobs.
    #[must_use]
    pub const fn feedback_config(mut self, config: FeedbackConfig) -> Self {
        self.feedback_config = config;
        self
    }

    /// Sets the retry backoff policy.
    #[must_use]
    pub const fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how many outcomes the feedback window retains.
    #[must_use]
    pub const fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Registers the decomposition strategy for a task kind.
    #[must_use]
    pub fn strategy(mut self, kind: impl Into<String>, strategy: Strategy) -> Self {
        self.strategies.push((kind.into(), strategy));
        self
    }

    /// Sets the strategy for kinds without an explicit registration.
    #[must_use]
    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Attaches telemetry; sub-components derive scoped handles from it.
    #[must_use]
    pub fn telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Assembles the runtime.
    #[must_use]
    pub fn build(self) -> EngineRuntime {
        let params = ParameterStore::new(self.params);
        let registry = CapabilityRegistry::new(params.clone());
        let mut builder =
            GraphBuilder::new(params.clone()).with_default_strategy(self.default_strategy);
        for (kind, strategy) in self.strategies {
            builder = builder.with_strategy(kind, strategy);
        }
        let supervisor = Arc::new(ExecutionSupervisor::new(self.executor, self.supervisor_config));
        let history = OutcomeHistory::new(self.history_capacity);

        let mut scheduler = Scheduler::new(
            registry.clone(),
            Arc::new(builder),
            supervisor,
            self.store,
        )
        .with_history(history.clone())
        .with_backoff(self.backoff)
        .with_limits(self.limits)
        .with_config(self.scheduler_config);
        if let Some(telemetry) = &self.telemetry {
            scheduler = scheduler.with_telemetry(telemetry.scoped("engine.scheduler"));
        }

        let feedback = Arc::new(FeedbackLoop::new(
            history,
            params.clone(),
            self.feedback_config,
            self.telemetry
                .as_ref()
                .map(|telemetry| telemetry.scoped("engine.feedback")),
        ));

        EngineRuntime {
            registry,
            scheduler,
            feedback,
            params,
            feedback_config: self.feedback_config,
        }
    }
}

/// The assembled engine: one handle for submissions, fleet management, and
/// the self-tuning loop.
#[derive(Clone)]
pub struct EngineRuntime {
    registry: CapabilityRegistry,
    scheduler: Scheduler,
    feedback: Arc<FeedbackLoop>,
    params: ParameterStore,
    feedback_config: FeedbackConfig,
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime").finish_non_exhaustive()
    }
}

impl EngineRuntime {
    /// Returns a builder with defaults.
    #[must_use]
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Registers a worker with the fleet.
    pub fn register_worker(&self, profile: WorkerProfile) -> Result<(), EngineError> {
        self.registry.register(profile)
    }

    /// Removes a drained worker from the fleet.
    pub fn deregister_worker(&self, id: WorkerId) -> Result<WorkerProfile, EngineError> {
        self.registry.deregister(id)
    }

    /// Observable view of every registered worker.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerView> {
        self.registry.snapshot()
    }

    /// Submits a task for decomposition and execution.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, EngineError> {
        self.scheduler.submit(request).await
    }

    /// Current state of one task.
    pub fn task_snapshot(&self, id: TaskId) -> Result<TaskSnapshot, EngineError> {
        self.scheduler.task_snapshot(id)
    }

    /// Snapshots of every known task.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.scheduler.task_snapshots()
    }

    /// Cancels a task; in-flight attempts settle cooperatively.
    pub async fn cancel(&self, id: TaskId) -> Result<(), EngineError> {
        self.scheduler.cancel(id).await
    }

    /// Polls until a task reaches a terminal state.
    pub async fn wait_until_terminal(&self, id: TaskId) -> Result<TaskSnapshot, EngineError> {
        self.scheduler.wait_until_terminal(id).await
    }

    /// The live tuning parameter snapshot.
    #[must_use]
    pub fn parameters(&self) -> Arc<TuningParameters> {
        self.params.load()
    }

    /// Runs one feedback cycle inline.
    pub fn run_feedback_cycle(&self) -> Result<Option<DeploymentEvent>, EngineError> {
        self.feedback.run_cycle()
    }

    /// Starts the background feedback loop.
    #[must_use]
    pub fn start_feedback(&self) -> FeedbackHandle {
        Arc::clone(&self.feedback).spawn(self.feedback_config.cycle_interval)
    }

    /// Parameter deployments made so far.
    #[must_use]
    pub fn deployments(&self) -> Vec<DeploymentEvent> {
        self.feedback.deployments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::TaskStatus;
    use crate::workers::LoopbackExecutor;
    use serde_json::json;

    #[tokio::test]
    async fn runtime_executes_a_task_end_to_end() {
        let runtime = EngineRuntime::builder()
            .executor(Arc::new(LoopbackExecutor))
            .build();
        runtime
            .register_worker(WorkerProfile::new("alpha", 2).with_skill("summarize", 0.9))
            .unwrap();

        let id = runtime
            .submit(TaskRequest::new("summarize", json!({ "doc": "x" })).with_complexity(0.2))
            .await
            .unwrap();
        let snapshot = runtime.wait_until_terminal(id).await.unwrap();
        assert_eq!(snapshot.record.status, TaskStatus::Completed);
        assert_eq!(runtime.tasks().len(), 1);
        assert_eq!(runtime.workers().len(), 1);
    }

    #[tokio::test]
    async fn feedback_cycle_is_a_no_op_without_history() {
        let runtime = EngineRuntime::builder().build();
        assert!(runtime.run_feedback_cycle().unwrap().is_none());
        assert!(runtime.deployments().is_empty());
        assert_eq!(
            *runtime.parameters(),
            TuningParameters::default()
        );
    }
}
