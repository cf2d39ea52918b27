//! Domain model for the delegation engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier assigned to every submitted task.
pub type TaskId = Uuid;
/// Identifier assigned to every subtask node.
pub type SubtaskId = Uuid;
/// Identifier assigned to every registered worker.
pub type WorkerId = Uuid;

/// Errors surfaced by the engine core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A worker with the same id is already registered.
    #[error("worker already registered: {0}")]
    DuplicateWorker(WorkerId),
    /// The worker still holds in-flight subtasks and must drain first.
    #[error("worker {id} busy with {in_flight} in-flight subtasks")]
    WorkerBusy {
        /// Worker identifier.
        id: WorkerId,
        /// Number of subtasks still in flight.
        in_flight: u32,
    },
    /// The requested worker does not exist.
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),
    /// No registered worker can take the subtask right now.
    #[error("no eligible worker for kind {0}")]
    NoEligibleWorker(String),
    /// The requested task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// The submission was rejected before entering the graph.
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// A structural defect (e.g. a cyclic decomposition). Fatal, never worked around.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Submission-time bounds enforced before a task enters the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Highest accepted priority value (lower value = more urgent).
    pub priority_max: u8,
    /// Cap on the per-subtask retry budget.
    pub max_retries_cap: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            priority_max: 100,
            max_retries_cap: 8,
        }
    }
}

/// Caller-facing submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task-type tag used for strategy selection and worker matching.
    pub kind: String,
    /// Opaque input handed to workers.
    pub payload: serde_json::Value,
    /// Priority, lower is more urgent.
    pub priority: u8,
    /// Complexity score in [0, 1] driving decomposition.
    pub complexity: f32,
    /// Per-subtask retry budget.
    pub max_retries: u32,
}

impl TaskRequest {
    /// Creates a request with default priority, complexity, and retry budget.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: 50,
            complexity: 0.2,
            max_retries: 2,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the complexity score.
    #[must_use]
    pub const fn with_complexity(mut self, complexity: f32) -> Self {
        self.complexity = complexity;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validates the request against the configured limits.
    pub fn validate(&self, limits: &EngineLimits) -> Result<(), EngineError> {
        if self.kind.trim().is_empty() {
            return Err(EngineError::InvalidTask("kind must not be empty".into()));
        }
        if payload_is_empty(&self.payload) {
            return Err(EngineError::InvalidTask("payload must not be empty".into()));
        }
        if !self.complexity.is_finite() || !(0.0..=1.0).contains(&self.complexity) {
            return Err(EngineError::InvalidTask(format!(
                "complexity {} outside [0, 1]",
                self.complexity
            )));
        }
        if self.priority > limits.priority_max {
            return Err(EngineError::InvalidTask(format!(
                "priority {} above maximum {}",
                self.priority, limits.priority_max
            )));
        }
        if self.max_retries > limits.max_retries_cap {
            return Err(EngineError::InvalidTask(format!(
                "max_retries {} above cap {}",
                self.max_retries, limits.max_retries_cap
            )));
        }
        Ok(())
    }
}

fn payload_is_empty(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Lifecycle state of a root task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Subtasks are pending or in flight.
    Running,
    /// Every subtask completed.
    Completed,
    /// A subtask failed terminally and could not be worked around.
    Failed {
        /// Category of the first terminal failure.
        category: ErrorCategory,
        /// The subtask that failed.
        subtask: SubtaskId,
    },
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Accepted task, immutable after decomposition except for status fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier.
    pub id: TaskId,
    /// Task-type tag.
    pub kind: String,
    /// Opaque input payload.
    pub payload: serde_json::Value,
    /// Priority, lower is more urgent.
    pub priority: u8,
    /// Complexity score in [0, 1].
    pub complexity: f32,
    /// Per-subtask retry budget.
    pub max_retries: u32,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// Terminal-state timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Accepts a validated request, assigning a fresh id.
    #[must_use]
    pub fn accept(request: TaskRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: request.kind,
            payload: request.payload,
            priority: request.priority,
            complexity: request.complexity,
            max_retries: request.max_retries,
            status: TaskStatus::Running,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Per-subtask lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Waiting on unsatisfied dependencies.
    Pending,
    /// All predecessors completed; eligible for dispatch.
    Ready,
    /// A worker has been selected, execution not yet started.
    Assigned,
    /// In flight on a worker.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its retry budget. Terminal.
    Failed,
    /// Failed with budget remaining; waiting out backoff.
    Retrying,
    /// Cancelled before completion. Terminal.
    Cancelled,
}

impl SubtaskStatus {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One vertex of a task's dependency DAG. Structure is immutable after
/// construction; only status fields mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier.
    pub id: SubtaskId,
    /// Owning task.
    pub task_id: TaskId,
    /// Skill/kind required to execute this node.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Complexity score in [0, 1].
    pub complexity: f32,
    /// Estimated execution duration in milliseconds.
    pub estimated_ms: u64,
    /// Predecessor node ids.
    pub depends_on: Vec<SubtaskId>,
    /// Best-effort branch: terminal failure does not fail the task.
    pub optional: bool,
    /// Current lifecycle state.
    pub status: SubtaskStatus,
    /// Worker the node is assigned to, once dispatched.
    pub assigned_worker: Option<WorkerId>,
    /// Attempts consumed so far.
    pub retry_count: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// First execution start.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-state timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Output attached on success.
    pub output: Option<serde_json::Value>,
}

/// Operational classification of a failed attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// The attempt exceeded its deadline.
    Timeout,
    /// The worker raised an execution failure.
    ExecutionError,
    /// The attempt was cancelled cooperatively.
    Cancelled,
    /// No eligible worker appeared within the maximum ready wait.
    CapacityExhausted,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::ExecutionError => write!(f, "EXECUTION_ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::CapacityExhausted => write!(f, "CAPACITY_EXHAUSTED"),
        }
    }
}

/// Immutable record of one subtask execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Subtask that was attempted.
    pub subtask_id: SubtaskId,
    /// Owning task.
    pub task_id: TaskId,
    /// Worker that ran the attempt.
    pub worker_id: WorkerId,
    /// Subtask kind, retained for replay analysis.
    pub kind: String,
    /// Subtask complexity, retained for replay analysis.
    pub complexity: f32,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Wall-clock duration of the attempt in milliseconds.
    pub duration_ms: u64,
    /// Failure classification, if any.
    pub error: Option<ErrorCategory>,
    /// Recording timestamp.
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// Records a successful attempt.
    #[must_use]
    pub fn success(subtask: &Subtask, worker_id: WorkerId, duration_ms: u64) -> Self {
        Self {
            subtask_id: subtask.id,
            task_id: subtask.task_id,
            worker_id,
            kind: subtask.kind.clone(),
            complexity: subtask.complexity,
            success: true,
            duration_ms,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// Records a failed attempt with the given category.
    #[must_use]
    pub fn failure(
        subtask: &Subtask,
        worker_id: WorkerId,
        duration_ms: u64,
        category: ErrorCategory,
    ) -> Self {
        Self {
            subtask_id: subtask.id,
            task_id: subtask.task_id,
            worker_id,
            kind: subtask.kind.clone(),
            complexity: subtask.complexity,
            success: false,
            duration_ms,
            error: Some(category),
            recorded_at: Utc::now(),
        }
    }
}

/// Weight vector driving worker scoring in the capability registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    /// Weight on skill-proficiency match.
    pub capability: f64,
    /// Weight on inverse current load.
    pub load: f64,
    /// Weight on historical success rate.
    pub success_rate: f64,
    /// Weight on inverse mean latency.
    pub latency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 0.35,
            load: 0.20,
            success_rate: 0.30,
            latency: 0.15,
        }
    }
}

impl ScoringWeights {
    /// Rescales the vector so its components sum to one.
    #[must_use]
    pub fn normalized(self) -> Self {
        let sum = self.capability + self.load + self.success_rate + self.latency;
        if sum <= f64::EPSILON {
            return Self::default();
        }
        Self {
            capability: self.capability / sum,
            load: self.load / sum,
            success_rate: self.success_rate / sum,
            latency: self.latency / sum,
        }
    }
}

/// Tunable configuration consumed by the scheduler and registry. Snapshots
/// are immutable; the feedback loop replaces them wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuningParameters {
    /// Complexity above which a task is decomposed.
    pub decomposition_threshold: f32,
    /// Maximum decomposition recursion depth.
    pub max_depth: u32,
    /// Worker scoring weights.
    pub scoring: ScoringWeights,
    /// Decay factor for worker running statistics, in (0, 1].
    pub ewma_decay: f64,
}

impl Default for TuningParameters {
    fn default() -> Self {
        Self {
            decomposition_threshold: 0.45,
            max_depth: 3,
            scoring: ScoringWeights::default(),
            ewma_decay: 0.3,
        }
    }
}

/// Atomically swapped holder of the live [`TuningParameters`] snapshot.
///
/// Readers clone the inner `Arc` and operate on one consistent, immutable
/// snapshot for the duration of a dispatch decision; writers replace the
/// whole set, so a torn intermediate state is unobservable.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    inner: Arc<RwLock<Arc<TuningParameters>>>,
}

impl ParameterStore {
    /// Creates a store seeded with the given parameters.
    #[must_use]
    pub fn new(params: TuningParameters) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(params))),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<TuningParameters> {
        Arc::clone(&self.inner.read())
    }

    /// Replaces the live snapshot, returning the previous one.
    pub fn swap(&self, params: Arc<TuningParameters>) -> Arc<TuningParameters> {
        std::mem::replace(&mut *self.inner.write(), params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_rejects_empty_payload() {
        let limits = EngineLimits::default();
        let request = TaskRequest::new("summarize", json!({}));
        assert!(matches!(
            request.validate(&limits),
            Err(EngineError::InvalidTask(_))
        ));
    }

    #[test]
    fn validation_rejects_out_of_range_fields() {
        let limits = EngineLimits::default();
        let bad_complexity = TaskRequest::new("summarize", json!({"doc": "x"})).with_complexity(1.2);
        assert!(bad_complexity.validate(&limits).is_err());

        let bad_priority = TaskRequest::new("summarize", json!({"doc": "x"})).with_priority(101);
        assert!(bad_priority.validate(&limits).is_err());

        let good = TaskRequest::new("summarize", json!({"doc": "x"}));
        assert!(good.validate(&limits).is_ok());
    }

    #[test]
    fn subtask_terminal_states() {
        assert!(SubtaskStatus::Completed.is_terminal());
        assert!(SubtaskStatus::Failed.is_terminal());
        assert!(SubtaskStatus::Cancelled.is_terminal());
        assert!(!SubtaskStatus::Retrying.is_terminal());
        assert!(!SubtaskStatus::Ready.is_terminal());
    }

    #[test]
    fn parameter_store_swaps_whole_snapshots() {
        let store = ParameterStore::default();
        let before = store.load();
        let mut next = (*before).clone();
        next.decomposition_threshold = 0.8;
        let old = store.swap(Arc::new(next));
        assert_eq!(old.decomposition_threshold, before.decomposition_threshold);
        assert!((store.load().decomposition_threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn scoring_weights_normalize_to_unit_sum() {
        let weights = ScoringWeights {
            capability: 2.0,
            load: 1.0,
            success_rate: 1.0,
            latency: 0.0,
        }
        .normalized();
        let sum = weights.capability + weights.load + weights.success_rate + weights.latency;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
