//! Scheduler: owns live task state and drives every subtask through its
//! lifecycle, from ready-set maintenance to retry and cascade handling.

/// Retry delay policy.
pub mod backoff;
/// Single-attempt execution discipline.
pub mod supervisor;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::BackoffPolicy;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use supervisor::{AttemptResult, ExecutionSupervisor};
use tokio::{sync::watch, time::sleep};

use crate::feedback::OutcomeHistory;
use crate::graph::{analysis, builder::GraphBuilder, TaskGraph};
use crate::module::{
    EngineError, EngineLimits, ErrorCategory, Subtask, SubtaskId, SubtaskStatus, TaskId,
    TaskRecord, TaskRequest, TaskStatus, WorkerId,
};
use crate::persistence::{SubtaskTransition, TaskStore};
use crate::registry::CapabilityRegistry;
use crate::telemetry::EngineTelemetry;

/// Scheduler timing knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a ready subtask may wait for an eligible worker before it
    /// fails with [`ErrorCategory::CapacityExhausted`].
    pub max_ready_wait_ms: u64,
    /// Delay before re-running a dispatch pass that left work stranded.
    pub capacity_retry_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_ready_wait_ms: 30_000,
            capacity_retry_ms: 200,
        }
    }
}

/// Point-in-time view of one task and its subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// The task record.
    pub record: TaskRecord,
    /// Every subtask, in graph insertion order.
    pub subtasks: Vec<Subtask>,
}

struct TaskRun {
    record: TaskRecord,
    graph: TaskGraph,
    remaining: IndexMap<SubtaskId, u64>,
    pending: IndexMap<SubtaskId, usize>,
    ready_since: IndexMap<SubtaskId, Instant>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    // Terminal status stays masked in snapshots until the store write for
    // the terminal record has settled.
    terminal_durable: bool,
}

impl TaskRun {
    fn observable(&self) -> TaskSnapshot {
        let mut record = self.record.clone();
        if record.status.is_terminal() && !self.terminal_durable {
            record.status = TaskStatus::Running;
            record.completed_at = None;
        }
        TaskSnapshot {
            record,
            subtasks: self.graph.nodes().cloned().collect(),
        }
    }
}

struct SchedState {
    tasks: IndexMap<TaskId, TaskRun>,
    repass_scheduled: bool,
}

struct AttemptStart {
    task_id: TaskId,
    subtask: Subtask,
    worker: WorkerId,
    payload: serde_json::Value,
    cancel: watch::Receiver<bool>,
}

/// Clone-shareable scheduler handle.
///
/// All task state lives behind one internal lock that is never held across
/// an await; dispatch decisions (score, reserve, mark assigned) are atomic
/// with respect to each other.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedState>>,
    registry: CapabilityRegistry,
    builder: Arc<GraphBuilder>,
    supervisor: Arc<ExecutionSupervisor>,
    history: OutcomeHistory,
    store: Arc<dyn TaskStore>,
    telemetry: Option<EngineTelemetry>,
    backoff: BackoffPolicy,
    limits: EngineLimits,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler over the given collaborators with default knobs.
    #[must_use]
    pub fn new(
        registry: CapabilityRegistry,
        builder: Arc<GraphBuilder>,
        supervisor: Arc<ExecutionSupervisor>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedState {
                tasks: IndexMap::new(),
                repass_scheduled: false,
            })),
            registry,
            builder,
            supervisor,
            history: OutcomeHistory::default(),
            store,
            telemetry: None,
            backoff: BackoffPolicy::default(),
            limits: EngineLimits::default(),
            config: SchedulerConfig::default(),
        }
    }

    /// Shares an outcome history with the feedback loop.
    #[must_use]
    pub fn with_history(mut self, history: OutcomeHistory) -> Self {
        self.history = history;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets the retry backoff policy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets submission-time limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the scheduler timing knobs.
    #[must_use]
    pub const fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// The outcome history the scheduler appends to.
    #[must_use]
    pub fn history(&self) -> OutcomeHistory {
        self.history.clone()
    }

    /// Validates, decomposes, and enqueues one task. Returns its id once the
    /// whole graph is recorded and the first dispatch pass has run.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, EngineError> {
        request.validate(&self.limits)?;
        let record = TaskRecord::accept(request);
        let mut graph = self.builder.decompose(&record)?;
        let remaining = analysis::remaining_weights(&graph)?;
        let pending = graph.pending_predecessors();

        let now = Instant::now();
        let mut ready_since = IndexMap::new();
        let mut transitions = Vec::new();
        for (id, count) in &pending {
            if *count == 0 {
                if let Some(node) = graph.node_mut(*id) {
                    node.status = SubtaskStatus::Ready;
                }
                ready_since.insert(*id, now);
                transitions.push(SubtaskTransition::now(
                    record.id,
                    *id,
                    SubtaskStatus::Ready,
                    0,
                ));
            }
        }

        self.store.record_task(&record).await?;
        for transition in &transitions {
            self.store.record_transition(transition).await?;
        }
        self.emit(
            "scheduler.task.accepted",
            json!({ "task": record.id, "kind": record.kind, "subtasks": graph.len() }),
        );

        let task_id = record.id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.state.lock().tasks.insert(
            task_id,
            TaskRun {
                record,
                graph,
                remaining,
                pending,
                ready_since,
                cancel_tx,
                cancel_rx,
                terminal_durable: false,
            },
        );
        self.dispatch_pass().await;
        Ok(task_id)
    }

    /// Current state of one task. A terminal status only shows up here once
    /// its journal write has settled.
    pub fn task_snapshot(&self, id: TaskId) -> Result<TaskSnapshot, EngineError> {
        let state = self.state.lock();
        let run = state.tasks.get(&id).ok_or(EngineError::TaskNotFound(id))?;
        Ok(run.observable())
    }

    /// Snapshots of every known task, oldest submission first.
    #[must_use]
    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.state
            .lock()
            .tasks
            .values()
            .map(TaskRun::observable)
            .collect()
    }

    /// Polls until the task reaches a terminal state.
    pub async fn wait_until_terminal(&self, id: TaskId) -> Result<TaskSnapshot, EngineError> {
        loop {
            let snapshot = self.task_snapshot(id)?;
            if snapshot.record.status.is_terminal() {
                return Ok(snapshot);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancels a task. Idempotent; a second call on a terminal task is a
    /// no-op. In-flight attempts are signalled and settle as cancelled.
    pub async fn cancel(&self, id: TaskId) -> Result<(), EngineError> {
        let mut transitions = Vec::new();
        let mut updated = None;
        {
            let mut state = self.state.lock();
            let run = state.tasks.get_mut(&id).ok_or(EngineError::TaskNotFound(id))?;
            if run.record.status.is_terminal() {
                return Ok(());
            }
            let _ = run.cancel_tx.send(true);
            let now = Utc::now();
            let ids: Vec<SubtaskId> = run.graph.nodes().map(|node| node.id).collect();
            for node_id in ids {
                let Some(node) = run.graph.node_mut(node_id) else {
                    continue;
                };
                if node.status.is_terminal() || node.status == SubtaskStatus::Running {
                    continue;
                }
                node.status = SubtaskStatus::Cancelled;
                node.completed_at = Some(now);
                run.ready_since.shift_remove(&node_id);
                transitions.push(SubtaskTransition::now(
                    id,
                    node_id,
                    SubtaskStatus::Cancelled,
                    node.retry_count,
                ));
            }
            run.record.status = TaskStatus::Cancelled;
            run.record.completed_at = Some(now);
            updated = Some(run.record.clone());
        }
        self.persist_transitions(&transitions).await;
        if let Some(record) = updated {
            self.persist_record(&record).await;
        }
        Ok(())
    }

    /// One dispatch pass: order the ready set by longest remaining critical
    /// path, then assign as many subtasks as the fleet can absorb.
    ///
    /// Boxed because the pass re-enters itself through spawned attempts and
    /// requeues, which makes the future type recursive.
    fn dispatch_pass(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.dispatch_pass_inner())
    }

    async fn dispatch_pass_inner(&self) {
        let mut starts: Vec<AttemptStart> = Vec::new();
        let mut transitions = Vec::new();
        let mut records = Vec::new();
        let mut schedule_repass = false;
        let stranded_ready;
        {
            let mut state = self.state.lock();
            let mut ready: Vec<(u64, u8, TaskId, SubtaskId)> = Vec::new();
            for run in state.tasks.values() {
                if run.record.status.is_terminal() {
                    continue;
                }
                for node in run.graph.nodes() {
                    if node.status == SubtaskStatus::Ready {
                        let weight = run
                            .remaining
                            .get(&node.id)
                            .copied()
                            .unwrap_or(node.estimated_ms);
                        ready.push((weight, run.record.priority, run.record.id, node.id));
                    }
                }
            }
            ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.3.cmp(&b.3)));

            let max_wait = Duration::from_millis(self.config.max_ready_wait_ms);
            let mut stranded = false;
            for (_, _, task_id, subtask_id) in ready {
                let Some(run) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if run.record.status.is_terminal() {
                    continue;
                }
                let still_ready = run
                    .graph
                    .node(subtask_id)
                    .is_some_and(|node| node.status == SubtaskStatus::Ready);
                if !still_ready {
                    continue;
                }
                let waited_out = run
                    .ready_since
                    .get(&subtask_id)
                    .is_some_and(|since| since.elapsed() >= max_wait);
                if waited_out {
                    Self::fail_terminal(
                        run,
                        subtask_id,
                        ErrorCategory::CapacityExhausted,
                        &mut transitions,
                        &mut records,
                    );
                    continue;
                }
                let kind = run
                    .graph
                    .node(subtask_id)
                    .map(|node| node.kind.clone())
                    .unwrap_or_default();
                match self.registry.select_and_reserve(&kind, &[]) {
                    Ok(worker) => {
                        let Some(node) = run.graph.node_mut(subtask_id) else {
                            self.registry.release(worker);
                            continue;
                        };
                        node.status = SubtaskStatus::Assigned;
                        node.assigned_worker = Some(worker);
                        run.ready_since.shift_remove(&subtask_id);
                        transitions.push(SubtaskTransition::now(
                            task_id,
                            subtask_id,
                            SubtaskStatus::Assigned,
                            node.retry_count,
                        ));
                        starts.push(AttemptStart {
                            task_id,
                            subtask: node.clone(),
                            worker,
                            payload: run.record.payload.clone(),
                            cancel: run.cancel_rx.clone(),
                        });
                    }
                    Err(_) => {
                        stranded = true;
                    }
                }
            }
            if stranded && !state.repass_scheduled {
                state.repass_scheduled = true;
                schedule_repass = true;
            }
            stranded_ready = stranded;
        }

        if !starts.is_empty() || stranded_ready {
            self.emit(
                "scheduler.pass.completed",
                json!({ "assigned": starts.len(), "stranded": stranded_ready }),
            );
        }
        self.persist_transitions(&transitions).await;
        for record in &records {
            self.persist_record(record).await;
        }
        for start in starts {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler
                    .run_attempt(start.task_id, start.subtask, start.worker, start.payload, start.cancel)
                    .await;
            });
        }
        if schedule_repass {
            let scheduler = self.clone();
            let delay = Duration::from_millis(self.config.capacity_retry_ms);
            tokio::spawn(async move {
                sleep(delay).await;
                scheduler.state.lock().repass_scheduled = false;
                scheduler.dispatch_pass().await;
            });
        }
    }

    async fn run_attempt(
        self,
        task_id: TaskId,
        mut subtask: Subtask,
        worker: WorkerId,
        payload: serde_json::Value,
        cancel: watch::Receiver<bool>,
    ) {
        let mut transitions = Vec::new();
        let mut proceed = false;
        {
            let mut state = self.state.lock();
            if let Some(run) = state.tasks.get_mut(&task_id) {
                if run.record.status.is_terminal() {
                    if let Some(node) = run.graph.node_mut(subtask.id) {
                        if !node.status.is_terminal() {
                            node.status = SubtaskStatus::Cancelled;
                            node.completed_at = Some(Utc::now());
                            transitions.push(SubtaskTransition::now(
                                task_id,
                                subtask.id,
                                SubtaskStatus::Cancelled,
                                node.retry_count,
                            ));
                        }
                    }
                } else if let Some(node) = run.graph.node_mut(subtask.id) {
                    node.status = SubtaskStatus::Running;
                    node.started_at = Some(Utc::now());
                    subtask = node.clone();
                    transitions.push(SubtaskTransition::now(
                        task_id,
                        subtask.id,
                        SubtaskStatus::Running,
                        node.retry_count,
                    ));
                    proceed = true;
                }
            }
        }
        self.persist_transitions(&transitions).await;
        if !proceed {
            self.registry.release(worker);
            return;
        }

        let result = self.supervisor.execute(&subtask, worker, payload, cancel).await;
        let _ = self.registry.record_outcome(&result.outcome);
        self.registry.release(worker);
        self.history.push(result.outcome.clone());
        if let Err(err) = self.store.record_outcome(&result.outcome).await {
            self.log(
                LogLevel::Error,
                "scheduler.outcome.persist_failed",
                json!({ "error": err.to_string() }),
            );
        }
        self.on_outcome(task_id, subtask.id, result).await;
        self.dispatch_pass().await;
    }

    async fn on_outcome(&self, task_id: TaskId, subtask_id: SubtaskId, result: AttemptResult) {
        let mut transitions = Vec::new();
        let mut records = Vec::new();
        let mut retry_attempt = None;
        {
            let mut state = self.state.lock();
            let Some(run) = state.tasks.get_mut(&task_id) else {
                return;
            };
            let status = run.graph.node(subtask_id).map(|node| node.status);
            if status != Some(SubtaskStatus::Running) {
                return;
            }
            let now = Utc::now();
            if result.outcome.success {
                if let Some(node) = run.graph.node_mut(subtask_id) {
                    node.status = SubtaskStatus::Completed;
                    node.completed_at = Some(now);
                    node.output = result.output;
                    transitions.push(SubtaskTransition::now(
                        task_id,
                        subtask_id,
                        SubtaskStatus::Completed,
                        node.retry_count,
                    ));
                }
                Self::unlock_dependents(run, subtask_id, &mut transitions);
                Self::maybe_finish(run, &mut records);
            } else {
                let category = result.outcome.error.unwrap_or(ErrorCategory::ExecutionError);
                match category {
                    ErrorCategory::Cancelled => {
                        if let Some(node) = run.graph.node_mut(subtask_id) {
                            node.status = SubtaskStatus::Cancelled;
                            node.completed_at = Some(now);
                            transitions.push(SubtaskTransition::now(
                                task_id,
                                subtask_id,
                                SubtaskStatus::Cancelled,
                                node.retry_count,
                            ));
                        }
                        Self::maybe_finish(run, &mut records);
                    }
                    _ => {
                        let retryable = category != ErrorCategory::CapacityExhausted
                            && run
                                .graph
                                .node(subtask_id)
                                .is_some_and(|node| node.retry_count < run.record.max_retries);
                        if retryable {
                            if let Some(node) = run.graph.node_mut(subtask_id) {
                                node.retry_count += 1;
                                node.status = SubtaskStatus::Retrying;
                                retry_attempt = Some(node.retry_count);
                                transitions.push(SubtaskTransition::now(
                                    task_id,
                                    subtask_id,
                                    SubtaskStatus::Retrying,
                                    node.retry_count,
                                ));
                            }
                        } else {
                            Self::fail_terminal(
                                run,
                                subtask_id,
                                category,
                                &mut transitions,
                                &mut records,
                            );
                        }
                    }
                }
            }
        }
        self.persist_transitions(&transitions).await;
        for record in &records {
            self.persist_record(record).await;
        }
        if let Some(attempt) = retry_attempt {
            let scheduler = self.clone();
            let delay = self.backoff.delay(attempt);
            tokio::spawn(async move {
                sleep(delay).await;
                scheduler.requeue(task_id, subtask_id).await;
            });
        }
    }

    /// Moves a retrying subtask back to ready once its backoff elapses.
    async fn requeue(&self, task_id: TaskId, subtask_id: SubtaskId) {
        let mut transitions = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(run) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if run.record.status.is_terminal() {
                return;
            }
            let Some(node) = run.graph.node_mut(subtask_id) else {
                return;
            };
            if node.status != SubtaskStatus::Retrying {
                return;
            }
            node.status = SubtaskStatus::Ready;
            run.ready_since.insert(subtask_id, Instant::now());
            transitions.push(SubtaskTransition::now(
                task_id,
                subtask_id,
                SubtaskStatus::Ready,
                node.retry_count,
            ));
        }
        self.persist_transitions(&transitions).await;
        self.dispatch_pass().await;
    }

    // Completion of `subtask_id` settles one predecessor edge per dependent;
    // dependents with no unsettled predecessors left become ready.
    fn unlock_dependents(
        run: &mut TaskRun,
        subtask_id: SubtaskId,
        transitions: &mut Vec<SubtaskTransition>,
    ) {
        for dependent in run.graph.dependents(subtask_id) {
            let Some(count) = run.pending.get_mut(&dependent) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                continue;
            }
            let Some(node) = run.graph.node_mut(dependent) else {
                continue;
            };
            if node.status != SubtaskStatus::Pending {
                continue;
            }
            node.status = SubtaskStatus::Ready;
            run.ready_since.insert(dependent, Instant::now());
            transitions.push(SubtaskTransition::now(
                run.record.id,
                dependent,
                SubtaskStatus::Ready,
                node.retry_count,
            ));
        }
    }

    // Terminal failure of one subtask. A required failure cancels everything
    // downstream and fails the task (first failure wins); an optional one is
    // treated as settled so dependents still run.
    fn fail_terminal(
        run: &mut TaskRun,
        subtask_id: SubtaskId,
        category: ErrorCategory,
        transitions: &mut Vec<SubtaskTransition>,
        records: &mut Vec<TaskRecord>,
    ) {
        let now = Utc::now();
        let Some(node) = run.graph.node_mut(subtask_id) else {
            return;
        };
        node.status = SubtaskStatus::Failed;
        node.completed_at = Some(now);
        let optional = node.optional;
        let retry_count = node.retry_count;
        run.ready_since.shift_remove(&subtask_id);
        transitions.push(SubtaskTransition::now(
            run.record.id,
            subtask_id,
            SubtaskStatus::Failed,
            retry_count,
        ));

        if optional {
            Self::unlock_dependents(run, subtask_id, transitions);
            Self::maybe_finish(run, records);
            return;
        }

        for dependent in run.graph.transitive_dependents(subtask_id) {
            let Some(node) = run.graph.node_mut(dependent) else {
                continue;
            };
            if node.status.is_terminal() || node.status == SubtaskStatus::Running {
                continue;
            }
            node.status = SubtaskStatus::Cancelled;
            node.completed_at = Some(now);
            run.ready_since.shift_remove(&dependent);
            transitions.push(SubtaskTransition::now(
                run.record.id,
                dependent,
                SubtaskStatus::Cancelled,
                node.retry_count,
            ));
        }
        if !run.record.status.is_terminal() {
            run.record.status = TaskStatus::Failed {
                category,
                subtask: subtask_id,
            };
            run.record.completed_at = Some(now);
            records.push(run.record.clone());
            // Stop in-flight siblings; their attempts settle as cancelled.
            let _ = run.cancel_tx.send(true);
        }
    }

    // Marks the task completed once every node is terminal and every
    // required node succeeded.
    fn maybe_finish(run: &mut TaskRun, records: &mut Vec<TaskRecord>) {
        if run.record.status.is_terminal() {
            return;
        }
        let all_terminal = run.graph.nodes().all(|node| node.status.is_terminal());
        if !all_terminal {
            return;
        }
        let required_done = run
            .graph
            .nodes()
            .filter(|node| !node.optional)
            .all(|node| node.status == SubtaskStatus::Completed);
        if required_done {
            run.record.status = TaskStatus::Completed;
            run.record.completed_at = Some(Utc::now());
            records.push(run.record.clone());
        }
    }

    async fn persist_transitions(&self, transitions: &[SubtaskTransition]) {
        for transition in transitions {
            if let Err(err) = self.store.record_transition(transition).await {
                self.log(
                    LogLevel::Error,
                    "scheduler.transition.persist_failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
    }

    async fn persist_record(&self, record: &TaskRecord) {
        if let Err(err) = self.store.record_task(record).await {
            self.log(
                LogLevel::Error,
                "scheduler.task.persist_failed",
                json!({ "error": err.to_string() }),
            );
        }
        if record.status.is_terminal() {
            let mut state = self.state.lock();
            if let Some(run) = state.tasks.get_mut(&record.id) {
                run.terminal_durable = true;
            }
        }
        let kind = match &record.status {
            TaskStatus::Running => "scheduler.task.running",
            TaskStatus::Completed => "scheduler.task.completed",
            TaskStatus::Failed { .. } => "scheduler.task.failed",
            TaskStatus::Cancelled => "scheduler.task.cancelled",
        };
        self.emit(kind, json!({ "task": record.id, "status": record.status }));
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
